use std::collections::{BTreeMap, VecDeque};
use std::time::Instant;

use crate::types::GateVerdict;

const RECENT_WINDOW: usize = 20;

/// Per-gate approval counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GateCounts {
    pub passed: u64,
    pub rejected: u64,
    pub abstained: u64,
}

/// Running counters and timings for the decision engine.
/// Tracks per-cycle timing, aggregate stats, and a rolling trade window.
pub struct AgentMetrics {
    pub cycles_run: u64,
    pub decisions_made: u64,
    pub actionable_decisions: u64,
    pub pipeline_approvals: u64,
    pub gates: BTreeMap<String, GateCounts>,
    pub entries_submitted: u64,
    pub entries_failed: u64,
    pub exits_triggered: u64,
    pub positions_closed: u64,
    pub decisions_abandoned: u64,
    pub alerts_raised: u64,
    pub total_pnl: f64,
    pub winning_trades: u64,
    pub losing_trades: u64,

    // Last cycle
    pub last_lifecycle_duration_ms: u64,
    pub last_decision_duration_ms: u64,
    pub last_total_duration_ms: u64,

    recent_trades: VecDeque<f64>,
    log_interval_cycles: u64,
}

impl AgentMetrics {
    pub fn new(log_interval_cycles: u64) -> Self {
        Self {
            cycles_run: 0,
            decisions_made: 0,
            actionable_decisions: 0,
            pipeline_approvals: 0,
            gates: BTreeMap::new(),
            entries_submitted: 0,
            entries_failed: 0,
            exits_triggered: 0,
            positions_closed: 0,
            decisions_abandoned: 0,
            alerts_raised: 0,
            total_pnl: 0.0,
            winning_trades: 0,
            losing_trades: 0,
            last_lifecycle_duration_ms: 0,
            last_decision_duration_ms: 0,
            last_total_duration_ms: 0,
            recent_trades: VecDeque::with_capacity(RECENT_WINDOW),
            log_interval_cycles,
        }
    }

    pub fn start_timer() -> Instant {
        Instant::now()
    }

    pub fn record_lifecycle_duration(&mut self, start: Instant) {
        self.last_lifecycle_duration_ms = start.elapsed().as_millis() as u64;
    }

    pub fn record_decision_duration(&mut self, start: Instant) {
        self.last_decision_duration_ms = start.elapsed().as_millis() as u64;
    }

    pub fn record_gate(&mut self, gate_name: &str, verdict: GateVerdict) {
        let counts = self.gates.entry(gate_name.to_string()).or_default();
        match verdict {
            GateVerdict::Pass => counts.passed += 1,
            GateVerdict::Reject => counts.rejected += 1,
            GateVerdict::Abstain => counts.abstained += 1,
        }
    }

    pub fn record_trade_result(&mut self, pnl: f64) {
        self.total_pnl += pnl;
        self.positions_closed += 1;
        if pnl > 0.0 {
            self.winning_trades += 1;
        } else {
            self.losing_trades += 1;
        }

        self.recent_trades.push_back(pnl);
        if self.recent_trades.len() > RECENT_WINDOW {
            self.recent_trades.pop_front();
        }
    }

    pub fn finish_cycle(&mut self, cycle_start: Instant) {
        self.last_total_duration_ms = cycle_start.elapsed().as_millis() as u64;
        self.cycles_run += 1;

        if self.log_interval_cycles > 0 && self.cycles_run.is_multiple_of(self.log_interval_cycles) {
            self.log_metrics();
        }
    }

    /// Rolling win rate over the last 20 closed trades (0-100%)
    pub fn recent_win_rate(&self) -> f64 {
        if self.recent_trades.is_empty() {
            return 0.0;
        }
        let wins = self.recent_trades.iter().filter(|pnl| **pnl > 0.0).count() as f64;
        (wins / self.recent_trades.len() as f64) * 100.0
    }

    pub fn recent_avg_pnl(&self) -> f64 {
        if self.recent_trades.is_empty() {
            return 0.0;
        }
        self.recent_trades.iter().sum::<f64>() / self.recent_trades.len() as f64
    }

    /// Overall win rate (0-100%)
    pub fn overall_win_rate(&self) -> f64 {
        let total = self.winning_trades + self.losing_trades;
        if total == 0 {
            return 0.0;
        }
        (self.winning_trades as f64 / total as f64) * 100.0
    }

    /// Share of actionable decisions that cleared every gate (0-100%)
    pub fn approval_rate(&self) -> f64 {
        if self.actionable_decisions == 0 {
            return 0.0;
        }
        (self.pipeline_approvals as f64 / self.actionable_decisions as f64) * 100.0
    }

    pub fn log_metrics(&self) {
        let gate_rejections = self
            .gates
            .iter()
            .map(|(name, c)| format!("{}={}/{}", name, c.rejected, c.passed + c.rejected + c.abstained))
            .collect::<Vec<_>>()
            .join(",");

        tracing::info!(
            cycles = self.cycles_run,
            decisions = self.decisions_made,
            actionable = self.actionable_decisions,
            approval_rate = format!("{:.1}%", self.approval_rate()),
            gate_rejections = gate_rejections,
            entries_submitted = self.entries_submitted,
            entries_failed = self.entries_failed,
            exits_triggered = self.exits_triggered,
            positions_closed = self.positions_closed,
            abandoned = self.decisions_abandoned,
            alerts = self.alerts_raised,
            total_pnl = format!("{:.2}", self.total_pnl),
            overall_win_rate = format!("{:.1}%", self.overall_win_rate()),
            recent_win_rate = format!("{:.1}%", self.recent_win_rate()),
            recent_avg_pnl = format!("{:.2}", self.recent_avg_pnl()),
            last_cycle_ms = self.last_total_duration_ms,
            last_lifecycle_ms = self.last_lifecycle_duration_ms,
            last_decision_ms = self.last_decision_duration_ms,
            "Engine metrics summary"
        );
    }

    pub fn to_json(&self) -> serde_json::Value {
        let gates: serde_json::Map<String, serde_json::Value> = self
            .gates
            .iter()
            .map(|(name, c)| {
                (
                    name.clone(),
                    serde_json::json!({
                        "passed": c.passed,
                        "rejected": c.rejected,
                        "abstained": c.abstained,
                    }),
                )
            })
            .collect();

        serde_json::json!({
            "cycles_run": self.cycles_run,
            "decisions_made": self.decisions_made,
            "actionable_decisions": self.actionable_decisions,
            "pipeline_approvals": self.pipeline_approvals,
            "gates": gates,
            "entries_submitted": self.entries_submitted,
            "entries_failed": self.entries_failed,
            "exits_triggered": self.exits_triggered,
            "positions_closed": self.positions_closed,
            "decisions_abandoned": self.decisions_abandoned,
            "alerts_raised": self.alerts_raised,
            "total_pnl": self.total_pnl,
            "winning_trades": self.winning_trades,
            "losing_trades": self.losing_trades,
            "last_total_duration_ms": self.last_total_duration_ms,
        })
    }

    /// Restore counters from persisted JSON. Unknown or missing keys are left as they are.
    pub fn restore_from_json(&mut self, json: &serde_json::Value) {
        let counters: [(&str, &mut u64); 13] = [
            ("cycles_run", &mut self.cycles_run),
            ("decisions_made", &mut self.decisions_made),
            ("actionable_decisions", &mut self.actionable_decisions),
            ("pipeline_approvals", &mut self.pipeline_approvals),
            ("entries_submitted", &mut self.entries_submitted),
            ("entries_failed", &mut self.entries_failed),
            ("exits_triggered", &mut self.exits_triggered),
            ("positions_closed", &mut self.positions_closed),
            ("decisions_abandoned", &mut self.decisions_abandoned),
            ("alerts_raised", &mut self.alerts_raised),
            ("winning_trades", &mut self.winning_trades),
            ("losing_trades", &mut self.losing_trades),
            ("last_total_duration_ms", &mut self.last_total_duration_ms),
        ];
        for (key, slot) in counters {
            if let Some(v) = json.get(key).and_then(|v| v.as_u64()) {
                *slot = v;
            }
        }
        if let Some(v) = json.get("total_pnl").and_then(|v| v.as_f64()) {
            self.total_pnl = v;
        }
        if let Some(gates) = json.get("gates").and_then(|v| v.as_object()) {
            for (name, counts) in gates {
                let read = |key: &str| counts.get(key).and_then(|v| v.as_u64()).unwrap_or(0);
                self.gates.insert(
                    name.clone(),
                    GateCounts {
                        passed: read("passed"),
                        rejected: read("rejected"),
                        abstained: read("abstained"),
                    },
                );
            }
        }
        tracing::info!(
            "Restored metrics from persisted state (cycles={})",
            self.cycles_run
        );
    }
}
