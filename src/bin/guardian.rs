//! Guardian entrypoint. Runs as a separate process from the runtime and
//! watches it through liveness records only.

use anyhow::Result;

use sentinelfx::alert::LogNotifier;
use sentinelfx::config::GuardianConfig;
use sentinelfx::guardian::Guardian;
use sentinelfx::liveness::FileRegistry;
use sentinelfx::logging::{json_log, obj, v_num, v_str};

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = GuardianConfig::from_env();
    let component_id =
        std::env::var("COMPONENT_ID").unwrap_or_else(|_| "runtime".to_string());

    json_log(
        "guardian",
        obj(&[
            ("event", v_str("startup")),
            ("component", v_str(&component_id)),
            ("stale_threshold_sec", v_num(cfg.stale_threshold_sec as f64)),
            ("max_restart_count", v_num(cfg.max_restart_count as f64)),
        ]),
    );

    let registry = FileRegistry::new(&cfg.liveness_dir)?;
    let mut guardian = Guardian::new(cfg, registry, Box::new(LogNotifier), &component_id);
    guardian.run().await;
    Ok(())
}
