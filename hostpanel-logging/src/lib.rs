//! Logging setup for the hostpanel binary.
//!
//! Output is driven by environment variables so operators can redirect the
//! reconciliation log of a cron sweep without touching the configuration:
//!
//! - `HOSTPANEL_LOG_LEVEL`: default filter when `RUST_LOG` is unset (`info`)
//! - `HOSTPANEL_LOG_OUTPUT`: `console`, `file`, `both` or `none`
//! - `HOSTPANEL_LOG_FORMAT`: `human` or `json`
//! - `HOSTPANEL_LOG_FILE`: file path for `file`/`both` (daily rotation)
//! - `HOSTPANEL_LOG_TAGS`: `key:value` span filters, e.g. `domain:example.com`

use std::{
    collections::HashMap,
    env,
    io::{self, Write},
    path::Path,
};
use tracing::{field::Visit, span, Metadata, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::MakeWriter,
    layer::{Context, Layer},
    prelude::*,
    registry, EnvFilter,
};

const DEFAULT_LOG_FILE: &str = "/var/log/hostpanel/hostpanel.log";

// --- Tee writer: console and file at once ---
struct Tee<A, B> {
    a: A,
    b: B,
}

impl<A, B> Write for Tee<A, B>
where
    A: Write,
    B: Write,
{
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let res_a = self.a.write(buf);
        let res_b = self.b.write(buf);
        res_a.or(res_b)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.a.flush()?;
        self.b.flush()
    }
}

#[derive(Clone)]
struct MakeTee<A, B> {
    make_a: A,
    make_b: B,
}

impl<'a, A, B, W1, W2> MakeWriter<'a> for MakeTee<A, B>
where
    A: MakeWriter<'a, Writer = W1>,
    B: MakeWriter<'a, Writer = W2>,
    W1: Write + 'a,
    W2: Write + 'a,
{
    type Writer = Tee<W1, W2>;
    fn make_writer(&'a self) -> Self::Writer {
        Tee {
            a: self.make_a.make_writer(),
            b: self.make_b.make_writer(),
        }
    }
}

// --- Span tag filtering ---
#[derive(Clone, Debug, PartialEq, Eq)]
struct Tag {
    key: String,
    value: String,
}

fn parse_tags(raw: &str) -> Vec<Tag> {
    raw.split(',')
        .filter_map(|s| {
            let mut parts = s.splitn(2, ':');
            let key = parts.next()?.trim().to_string();
            let value = parts.next()?.trim().to_string();
            if key.is_empty() {
                None
            } else {
                Some(Tag { key, value })
            }
        })
        .collect()
}

struct TagFilterLayer {
    filters: Vec<Tag>,
}

impl<S> Layer<S> for TagFilterLayer
where
    S: Subscriber + for<'lookup> tracing_subscriber::registry::LookupSpan<'lookup>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        if let Some(span) = ctx.span(id) {
            let mut fields = HashMap::new();
            let mut visitor = FieldVisitor(&mut fields);
            attrs.record(&mut visitor);
            span.extensions_mut().insert(fields);
        }
    }

    fn enabled(&self, _meta: &Metadata<'_>, ctx: Context<'_, S>) -> bool {
        if self.filters.is_empty() {
            return true;
        }

        let scope = match ctx.current_span().id().and_then(|id| ctx.span_scope(id)) {
            Some(scope) => scope,
            None => return false,
        };

        let mut all_fields = HashMap::new();
        for span_ref in scope {
            if let Some(fields) = span_ref.extensions().get::<HashMap<String, String>>() {
                for (k, v) in fields {
                    all_fields.entry(k.clone()).or_insert_with(|| v.clone());
                }
            }
        }

        self.filters.iter().all(|filter| {
            all_fields
                .get(&filter.key)
                .is_some_and(|value| filter.value == "*" || value.contains(&filter.value))
        })
    }
}

struct FieldVisitor<'a>(&'a mut HashMap<String, String>);

impl Visit for FieldVisitor<'_> {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.0.insert(field.name().to_string(), value.to_string());
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        self.0.insert(field.name().to_string(), format!("{value:?}"));
    }
}

/// Resolved logging settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub level: String,
    pub output: String,
    pub json: bool,
    pub file_path: String,
    pub tags: String,
}

impl LogSettings {
    /// Read settings from the `HOSTPANEL_LOG_*` environment variables.
    ///
    /// `debug` raises the default level to `debug` when no level is set.
    pub fn from_env(debug: bool) -> Self {
        let default_level = if debug { "debug" } else { "info" };
        Self {
            level: env::var("HOSTPANEL_LOG_LEVEL").unwrap_or_else(|_| default_level.to_string()),
            output: env::var("HOSTPANEL_LOG_OUTPUT").unwrap_or_else(|_| "console".to_string()),
            json: env::var("HOSTPANEL_LOG_FORMAT").is_ok_and(|f| f == "json"),
            file_path: env::var("HOSTPANEL_LOG_FILE")
                .unwrap_or_else(|_| DEFAULT_LOG_FILE.to_string()),
            tags: env::var("HOSTPANEL_LOG_TAGS").unwrap_or_default(),
        }
    }
}

/// Initializes the global tracing subscriber.
///
/// Returns the file writer guard when logging to a file; keep it alive for the
/// lifetime of the process so buffered lines are flushed.
pub fn init_subscriber(settings: &LogSettings) -> Option<WorkerGuard> {
    let mut env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.level));
    for directive in ["tera=warn", "globset=warn"] {
        if let Ok(directive) = directive.parse() {
            env_filter = env_filter.add_directive(directive);
        }
    }

    let tag_filter_layer = TagFilterLayer {
        filters: parse_tags(&settings.tags),
    };

    let use_console = settings.output == "console" || settings.output == "both";
    let use_file = settings.output == "file" || settings.output == "both";

    let mut guard: Option<WorkerGuard> = None;
    let subscriber = registry().with(env_filter).with(tag_filter_layer);

    let log_path = Path::new(&settings.file_path);
    let log_dir = log_path.parent().unwrap_or_else(|| Path::new("/tmp"));
    let log_filename = log_path.file_name().unwrap_or("hostpanel.log".as_ref());

    // Console output goes to stderr; stdout is reserved for command results.
    let result = if use_console && use_file {
        let file_appender = tracing_appender::rolling::daily(log_dir, log_filename);
        let (non_blocking, file_guard) = tracing_appender::non_blocking(file_appender);
        guard = Some(file_guard);

        let tee_writer = MakeTee {
            make_a: std::io::stderr,
            make_b: non_blocking,
        };
        let fmt_layer = tracing_subscriber::fmt::layer().with_writer(tee_writer);
        if settings.json {
            subscriber.with(fmt_layer.json()).try_init()
        } else {
            subscriber.with(fmt_layer).try_init()
        }
    } else if use_console {
        let fmt_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
        if settings.json {
            subscriber.with(fmt_layer.json()).try_init()
        } else {
            subscriber.with(fmt_layer).try_init()
        }
    } else if use_file {
        let file_appender = tracing_appender::rolling::daily(log_dir, log_filename);
        let (non_blocking, file_guard) = tracing_appender::non_blocking(file_appender);
        guard = Some(file_guard);

        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(non_blocking);
        if settings.json {
            subscriber.with(fmt_layer.json()).try_init()
        } else {
            subscriber.with(fmt_layer).try_init()
        }
    } else {
        subscriber.try_init()
    };

    if let Err(e) = result {
        eprintln!("hostpanel: logging already initialized: {e}");
    }

    guard
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_parse_tags() {
        let tags = parse_tags("domain:example.com, step:*,broken");
        assert_eq!(
            tags,
            vec![
                Tag {
                    key: "domain".into(),
                    value: "example.com".into()
                },
                Tag {
                    key: "step".into(),
                    value: "*".into()
                },
            ]
        );
        assert!(parse_tags("").is_empty());
    }

    #[test]
    #[serial]
    fn test_settings_from_env_defaults() {
        env::remove_var("HOSTPANEL_LOG_LEVEL");
        env::remove_var("HOSTPANEL_LOG_OUTPUT");
        env::remove_var("HOSTPANEL_LOG_FORMAT");
        env::remove_var("HOSTPANEL_LOG_FILE");
        let settings = LogSettings::from_env(false);
        assert_eq!(settings.level, "info");
        assert_eq!(settings.output, "console");
        assert!(!settings.json);
        assert_eq!(settings.file_path, DEFAULT_LOG_FILE);

        assert_eq!(LogSettings::from_env(true).level, "debug");
    }

    #[test]
    #[serial]
    fn test_settings_from_env_overrides() {
        env::set_var("HOSTPANEL_LOG_FORMAT", "json");
        env::set_var("HOSTPANEL_LOG_OUTPUT", "file");
        let settings = LogSettings::from_env(false);
        assert!(settings.json);
        assert_eq!(settings.output, "file");
        env::remove_var("HOSTPANEL_LOG_FORMAT");
        env::remove_var("HOSTPANEL_LOG_OUTPUT");
    }
}
