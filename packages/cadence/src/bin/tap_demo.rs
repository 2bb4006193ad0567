//! Tap scenario with logging enabled.
//!
//! Registers action 1 on `tap_down` + `tap_up`, replays a few taps, and
//! schedules a wake entry that is bridged onto the background queue.
//!
//! ```text
//! RUST_LOG=debug cargo run --bin tap_demo
//! ```

use std::time::Duration;

use anyhow::{Context, Result};
use cadence::{handler, ActionId, EngineBuilder, EngineConfig, Queue, WakeConfig, WakeScheduler};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const TAP: ActionId = ActionId(1);
const REMINDER: ActionId = ActionId(2);

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,cadence=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let engine_config = EngineConfig::from_env().context("Failed to load engine configuration")?;
    let wake_config = WakeConfig::from_env().context("Failed to load wake configuration")?;

    let (handle, ui) = EngineBuilder::new(handler(|action, success, extra, payload| {
        match payload.tag() {
            Some(tag) => tracing::info!(%action, tag, "wake entry delivered"),
            None => tracing::info!(%action, success, extra, "action fired"),
        }
    }))
    .with_config(engine_config)
    .build()
    .start()
    .context("Failed to start engine")?;
    tokio::spawn(ui.run());

    handle.register_permanent(TAP, ["tap_down", "tap_up"], Queue::Ui)?;

    tracing::info!("tap_down");
    handle.signal("tap_down", true);
    tracing::info!("tap_up (fires)");
    handle.signal("tap_up", true);
    tracing::info!("tap_up again (no change, no fire)");
    handle.signal("tap_up", true);
    tracing::info!("tap_up failed (fires with success=false)");
    handle.signal("tap_up", false);

    let wake = WakeScheduler::builder(handle.queue_handler(Queue::Background))
        .config(wake_config)
        .discard_corrupt_state(true)
        .open()
        .context("Failed to open wake scheduler")?;
    wake.schedule_delayed(REMINDER, Duration::from_millis(300), "reminder")?;

    tokio::time::sleep(Duration::from_secs(1)).await;

    wake.stop();
    handle.stop();
    tracing::info!("demo finished");
    Ok(())
}
