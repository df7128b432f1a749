use hostpanel_core::{CommandExecutor, CommandSpec, Result};
use tracing::info;

/// `<manager> reload <service>`, e.g. `systemctl reload nginx`.
pub fn reload_service(
    executor: &dyn CommandExecutor,
    manager: &str,
    service: &str,
    timeout_secs: u64,
) -> Result<()> {
    let spec = CommandSpec::new(manager)
        .args(["reload", service])
        .timeout_secs(timeout_secs);
    executor.run_checked(&spec)?;
    info!(service, "reloaded service");
    Ok(())
}
