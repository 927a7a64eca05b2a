//! One receding-horizon control cycle: read state, forecast, optimise, act.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Local};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::domain::{step_duration, HistoryTable, TankGeometry, TunnelState, STEPS_PER_HOUR};
use crate::forecast::{ForecastEngine, HorizonForecast};
use crate::optimizer::{MpcEngine, MpcError, OptimizationProblem, Trajectory};

/// Receives the flow set-point for the coming step.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PumpActuator: Send + Sync {
    async fn set_flow(&self, flow_m3h: f64) -> Result<()>;
}

/// Actuator for dry runs: the command only goes to the log.
pub struct LogActuator;

#[async_trait]
impl PumpActuator for LogActuator {
    async fn set_flow(&self, flow_m3h: f64) -> Result<()> {
        info!(flow_m3h, "pump set-point (dry run)");
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum CycleDecision {
    Pump {
        flow_m3h: f64,
        valid_from: DateTime<FixedOffset>,
        expected_level_m: f64,
    },
    /// No command issued; the previous set-point stays in force.
    Hold { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub cycle_id: Uuid,
    pub started_at: DateTime<FixedOffset>,
    pub state: TunnelState,
    pub decision: CycleDecision,
    pub forecast: HorizonForecast,
    pub trajectory: Option<Trajectory>,
}

pub struct CycleOrchestrator {
    forecasts: ForecastEngine,
    mpc: MpcEngine,
    actuator: Arc<dyn PumpActuator>,
    horizon: usize,
    timestep_hours: f64,
}

impl CycleOrchestrator {
    pub fn new(
        forecasts: ForecastEngine,
        mpc: MpcEngine,
        actuator: Arc<dyn PumpActuator>,
        horizon: usize,
        timestep_hours: f64,
    ) -> Self {
        Self {
            forecasts,
            mpc,
            actuator,
            horizon,
            timestep_hours,
        }
    }

    pub fn from_config(cfg: &Config, geometry: TankGeometry, actuator: Arc<dyn PumpActuator>) -> Result<Self> {
        let forecasts = ForecastEngine::from_config(&cfg.forecast).context("building forecast engine")?;
        Ok(Self::new(
            forecasts,
            MpcEngine::from_config(cfg, geometry),
            actuator,
            cfg.mpc.horizon_steps,
            cfg.mpc.timestep_hours(),
        ))
    }

    pub fn geometry(&self) -> &TankGeometry {
        self.mpc.geometry()
    }

    /// Run one cycle on the history up to now. Optimisation failures hold the
    /// pumps and still produce a report; only missing state or a failed
    /// actuator command is an error.
    pub async fn run_cycle(&mut self, history: &HistoryTable) -> Result<CycleReport> {
        let started_at = Local::now().fixed_offset();
        let cycle_id = Uuid::new_v4();
        let latest = history.latest().context("operations history is empty")?;
        let state = TunnelState::from_level(latest.level_m, self.mpc.geometry(), latest.timestamp);
        let start = latest.timestamp + step_duration();
        info!(
            %cycle_id,
            level_m = state.level_m,
            volume_m3 = state.volume_m3,
            %start,
            horizon = self.horizon,
            "starting control cycle"
        );

        let forecast = self.forecasts.forecast_horizon(history, start, self.horizon).await;
        info!(
            price_source = ?forecast.price.source,
            inflow_source = ?forecast.inflow.source,
            "forecasts ready"
        );

        let (decision, trajectory) = match self.optimise(&state, &forecast) {
            Ok(trajectory) => match trajectory.first().cloned() {
                Some(first) => {
                    self.actuator
                        .set_flow(first.pump_flow_m3h)
                        .await
                        .context("sending pump set-point")?;
                    info!(
                        %cycle_id,
                        flow_m3h = first.pump_flow_m3h,
                        total_energy_cost = trajectory.total_energy_cost,
                        "applied first step of pump schedule"
                    );
                    let next_level = trajectory.steps.get(1).map_or(first.level_m, |s| s.level_m);
                    (
                        CycleDecision::Pump {
                            flow_m3h: first.pump_flow_m3h,
                            valid_from: first.timestamp,
                            expected_level_m: next_level,
                        },
                        Some(trajectory),
                    )
                }
                None => (
                    CycleDecision::Hold {
                        reason: "empty trajectory".to_string(),
                    },
                    None,
                ),
            },
            Err(e) => {
                warn!(%cycle_id, error = %e, "optimisation failed, holding current pump set-point");
                (CycleDecision::Hold { reason: e.to_string() }, None)
            }
        };

        Ok(CycleReport {
            cycle_id,
            started_at,
            state,
            decision,
            forecast,
            trajectory,
        })
    }

    fn optimise(&self, state: &TunnelState, forecast: &HorizonForecast) -> Result<Trajectory, MpcError> {
        // inflow forecasts are per 15-minute step, the optimiser works in m³/h
        let inflow_m3h: Vec<f64> = forecast
            .inflow
            .series
            .values()
            .into_iter()
            .map(|v| v * STEPS_PER_HOUR)
            .collect();
        let problem = OptimizationProblem::new(
            self.timestep_hours,
            state.volume_m3,
            inflow_m3h,
            forecast.price.series.values(),
            forecast.price.series.timestamps(),
        )?;
        self.mpc.solve(&problem)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::HistoricalRecord;
    use chrono::TimeZone;

    fn history(days: usize, level_m: f64) -> HistoryTable {
        let t0 = FixedOffset::east_opt(2 * 3600)
            .unwrap()
            .with_ymd_and_hms(2024, 11, 10, 0, 0, 0)
            .unwrap();
        HistoryTable::new((0..days * 96).map(|i| {
            let hour = (i % 96) as f64 / 4.0;
            HistoricalRecord {
                timestamp: t0 + step_duration() * i as i32,
                inflow_m3: 350.0 + 50.0 * (2.0 * std::f64::consts::PI * hour / 24.0).sin(),
                price_per_kwh: 0.04 + 0.03 * (2.0 * std::f64::consts::PI * (hour - 6.0) / 24.0).sin(),
                level_m,
            }
        }))
    }

    fn orchestrator(actuator: MockPumpActuator) -> CycleOrchestrator {
        let cfg = Config::default();
        CycleOrchestrator::from_config(&cfg, TankGeometry::affine(10_000.0, 350.0), Arc::new(actuator)).unwrap()
    }

    #[tokio::test]
    async fn test_cycle_applies_first_step() {
        let mut actuator = MockPumpActuator::new();
        actuator
            .expect_set_flow()
            .withf(|f| (100.0..=10_000.0).contains(f))
            .times(1)
            .returning(|_| Ok(()));
        let mut orch = orchestrator(actuator);

        let report = orch.run_cycle(&history(3, 2.0)).await.unwrap();
        let trajectory = report.trajectory.expect("trajectory");
        assert_eq!(trajectory.len(), 96);
        match report.decision {
            CycleDecision::Pump { flow_m3h, .. } => assert_eq!(flow_m3h, trajectory.steps[0].pump_flow_m3h),
            CycleDecision::Hold { reason } => panic!("unexpected hold: {reason}"),
        }
        assert!((trajectory.levels()[95] - 0.5).abs() < 1e-6);
        assert!((trajectory.steps[0].inflow_m3h - 4.0 * report.forecast.inflow.series.values()[0]).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_infeasible_cycle_holds() {
        let mut actuator = MockPumpActuator::new();
        actuator.expect_set_flow().times(0);
        let mut orch = orchestrator(actuator);

        // above the allowed band: no feasible trajectory exists
        let report = orch.run_cycle(&history(2, 35.0)).await.unwrap();
        assert!(report.trajectory.is_none());
        assert!(matches!(report.decision, CycleDecision::Hold { .. }));
    }

    #[tokio::test]
    async fn test_empty_history_is_an_error() {
        let mut orch = orchestrator(MockPumpActuator::new());
        assert!(orch.run_cycle(&HistoryTable::default()).await.is_err());
    }

    #[tokio::test]
    async fn test_actuator_failure_is_reported() {
        let mut actuator = MockPumpActuator::new();
        actuator
            .expect_set_flow()
            .returning(|_| Err(anyhow::anyhow!("modbus timeout")));
        let mut orch = orchestrator(actuator);
        assert!(orch.run_cycle(&history(2, 2.0)).await.is_err());
    }
}
