//! Runtime entrypoint: wires journal, state machine, command bus, snapshot
//! store and heartbeat together. The guardian runs as its own binary.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use sentinelfx::bus::CommandBus;
use sentinelfx::config::Config;
use sentinelfx::handlers::{default_handlers, NullExecutor};
use sentinelfx::lifecycle::StateMachine;
use sentinelfx::liveness::{FileRegistry, LivenessRecord, LivenessRegistry};
use sentinelfx::logging::{json_log, obj, v_num, v_str};
use sentinelfx::reliability::journal::Journal;
use sentinelfx::storage::StateStore;

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env();

    // Startup gate: a broken chain means the history cannot be trusted and
    // the operator must intervene before any new command is admitted.
    let (ok, broken) = Journal::verify_chain(&cfg.journal_path)
        .with_context(|| format!("verify journal {}", cfg.journal_path))?;
    if !ok {
        bail!(
            "journal chain broken at seq {:?}, refusing to start",
            broken
        );
    }

    let entries = Journal::read_all(&cfg.journal_path)?;
    let recovered = StateMachine::replay(&entries);
    json_log(
        "runtime",
        obj(&[
            ("event", v_str("startup")),
            ("journal_entries", v_num(entries.len() as f64)),
            ("recovered_state", v_str(recovered.as_str())),
        ]),
    );

    let journal = Journal::open(&cfg.journal_path)?;
    let machine = StateMachine::with_state(recovered);
    let store = StateStore::open(&cfg.sqlite_path)?;
    let handlers = default_handlers(Arc::new(NullExecutor));

    let bus = CommandBus::new(&cfg, journal, machine, handlers).with_store(store);
    let (handle, bus_join) = bus.spawn(cfg.bus_channel_capacity);
    // The handle is what an embedding ingress (gateway, strategy loop)
    // clones to submit commands; here it only keeps the sequencer alive.
    let _ingress = handle;

    let registry = FileRegistry::new(&cfg.liveness_dir)?;
    let component_id = cfg.component_id.clone();
    let heartbeat_secs = cfg.heartbeat_secs;
    let kill_file = cfg.kill_file.clone();
    let heartbeat = tokio::spawn({
        let component_id = component_id.clone();
        async move {
            let mut tick = tokio::time::interval(Duration::from_secs(heartbeat_secs.max(1)));
            loop {
                tick.tick().await;
                if Path::new(&kill_file).exists() {
                    json_log("runtime", obj(&[("event", v_str("kill_file_seen"))]));
                    std::process::exit(0);
                }
                if let Err(e) = registry.beat(&LivenessRecord::now(&component_id)) {
                    json_log(
                        "runtime",
                        obj(&[
                            ("event", v_str("heartbeat_failed")),
                            ("error", v_str(&e.to_string())),
                        ]),
                    );
                }
            }
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            json_log("runtime", obj(&[("event", v_str("shutdown_signal"))]));
        }
        res = bus_join => {
            match res {
                Ok(bus) => json_log(
                    "runtime",
                    obj(&[
                        ("event", v_str("bus_stopped")),
                        ("final_state", v_str(bus.current_state().as_str())),
                    ]),
                ),
                Err(e) => json_log(
                    "runtime",
                    obj(&[("event", v_str("bus_panicked")), ("error", v_str(&e.to_string()))]),
                ),
            }
        }
    }

    heartbeat.abort();
    Ok(())
}
