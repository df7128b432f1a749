use std::sync::OnceLock;

use hostpanel_core::{HostError, Result};
use tera::{Context as TeraContext, Tera};

pub(crate) const POOL: &str = "pool.conf";
pub(crate) const VHOST: &str = "vhost.conf";
pub(crate) const SUSPENDED_VHOST: &str = "suspended.conf";
pub(crate) const WELCOME_PAGE: &str = "welcome.html";
pub(crate) const WP_CONFIG: &str = "wp-config.php";

/// Static page served for suspended sites.
pub(crate) const SUSPENDED_PAGE: &str = include_str!("templates/suspended.html");

/// Shared template engine for generated configuration files
static TERA: OnceLock<Tera> = OnceLock::new();

fn get_tera() -> &'static Tera {
    TERA.get_or_init(|| {
        let mut tera = Tera::default();
        tera.add_raw_templates(vec![
            (POOL, include_str!("templates/pool.conf")),
            (VHOST, include_str!("templates/vhost.conf")),
            (SUSPENDED_VHOST, include_str!("templates/suspended.conf")),
            (WELCOME_PAGE, include_str!("templates/welcome.html")),
            (WP_CONFIG, include_str!("templates/wp-config.php")),
        ])
        .expect("Failed to add hostpanel templates");
        tera
    })
}

pub(crate) fn render(name: &str, context: &TeraContext) -> Result<String> {
    get_tera()
        .render(name, context)
        .map_err(|e| HostError::Template(format!("{}: {:?}", name, e)))
}
