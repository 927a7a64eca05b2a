use std::sync::Arc;
use tunnel_flow_controller::config::Config;
use tunnel_flow_controller::controller::{CycleDecision, CycleOrchestrator, LogActuator};
use tunnel_flow_controller::domain::{GeometryFidelity, HistoryTable, TankGeometry};

fn sample_history(cfg: &Config) -> HistoryTable {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/data/hsy_data.csv");
    HistoryTable::from_csv_path(path, cfg.history.offset().unwrap()).unwrap()
}

#[tokio::test]
async fn full_cycle_on_sample_data() {
    let cfg = Config::default();
    let calibration = concat!(env!("CARGO_MANIFEST_DIR"), "/data/tunnel_calibration.csv");
    let geometry = TankGeometry::load_or_fallback(
        Some(std::path::Path::new(calibration)),
        cfg.tunnel.affine_slope_m2,
        cfg.tunnel.affine_offset_m3,
    );
    assert_eq!(geometry.fidelity(), GeometryFidelity::Calibrated);

    let history = sample_history(&cfg);
    let mut orchestrator = CycleOrchestrator::from_config(&cfg, geometry, Arc::new(LogActuator)).unwrap();
    let report = orchestrator.run_cycle(&history).await.unwrap();

    let trajectory = report.trajectory.as_ref().expect("trajectory");
    assert_eq!(trajectory.len(), cfg.mpc.horizon_steps);
    assert!(matches!(report.decision, CycleDecision::Pump { .. }));
    assert!((trajectory.levels()[cfg.mpc.horizon_steps - 1] - cfg.tunnel.drawdown_target_m).abs() < 1e-6);

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["decision"]["action"], "pump");
    assert_eq!(json["trajectory"]["geometry_fidelity"], "calibrated");
}

#[tokio::test]
async fn missing_calibration_falls_back_and_still_plans() {
    let cfg = Config::default();
    let geometry = TankGeometry::load_or_fallback(
        Some(std::path::Path::new("does/not/exist.csv")),
        cfg.tunnel.affine_slope_m2,
        cfg.tunnel.affine_offset_m3,
    );
    let mut orchestrator = CycleOrchestrator::from_config(&cfg, geometry, Arc::new(LogActuator)).unwrap();
    let report = orchestrator.run_cycle(&sample_history(&cfg)).await.unwrap();

    let trajectory = report.trajectory.expect("trajectory");
    assert_eq!(trajectory.geometry_fidelity, GeometryFidelity::AffineFallback);
}
