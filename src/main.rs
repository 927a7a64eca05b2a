use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;
use tunnel_flow_controller::{config, controller, domain, telemetry};

use config::Config;
use controller::{CycleOrchestrator, LogActuator};
use domain::{HistoryTable, TankGeometry};
use telemetry::init_tracing;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cfg = Config::load().context("loading configuration")?;
    let history = HistoryTable::from_csv_path(&cfg.history.path, cfg.history.offset()?)?;
    let geometry = TankGeometry::load_or_fallback(
        cfg.tunnel.calibration_path.as_deref(),
        cfg.tunnel.affine_slope_m2,
        cfg.tunnel.affine_offset_m3,
    );
    info!(
        history_rows = history.len(),
        fidelity = ?geometry.fidelity(),
        horizon = cfg.mpc.horizon_steps,
        "starting tunnel flow controller"
    );

    let mut orchestrator = CycleOrchestrator::from_config(&cfg, geometry, Arc::new(LogActuator))?;
    let report = orchestrator.run_cycle(&history).await?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
