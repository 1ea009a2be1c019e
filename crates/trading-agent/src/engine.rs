use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use broker_trait::{
    ExecutionGateway, Fill, FillStatus, GatewayError, OrderHandle, OrderRequest, OrderSide,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ensemble_voter::{EnsembleVoter, SignalCollector};
use risk_manager::{
    Alert, AlertKind, AlertSeverity, FillEvent, PositionSize, RiskManager, StateStore,
};
use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use trading_core::{
    AssetClass, Decision, ExitProfile, MarketContext, Position, PositionSide, PositionState,
    SignalSource,
};

use crate::config::{ConfigError, PipelineConfig};
use crate::gates::GatePipeline;
use crate::metrics::AgentMetrics;
use crate::position_manager::PositionLifecycleManager;
use crate::types::{GateResult, LifecycleTransition, PipelineOutcome};

/// Entry order submitted but not yet filled
#[derive(Debug, Clone)]
struct PendingEntry {
    handle: OrderHandle,
    side: PositionSide,
    size: PositionSize,
    asset_class: AssetClass,
    profile: ExitProfile,
}

/// What happened to one instrument's entry decision this cycle
#[derive(Debug, Clone, Serialize)]
pub struct InstrumentOutcome {
    pub instrument: String,
    pub decision: Decision,
    pub gate_results: Vec<GateResult>,
    pub approved: bool,
    pub order_submitted: bool,
    pub order_id: Option<String>,
    /// Sources that timed out, failed or were dropped for this instrument
    pub missing_sources: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub decisions: Vec<InstrumentOutcome>,
    pub entries_filled: Vec<String>,
    pub entries_failed: Vec<String>,
    pub transitions: Vec<LifecycleTransition>,
    /// Instruments still in flight at the cycle deadline
    pub abandoned: Vec<String>,
    pub alerts: Vec<Alert>,
}

impl CycleReport {
    pub fn outcome(&self, instrument: &str) -> Option<&InstrumentOutcome> {
        self.decisions.iter().find(|d| d.instrument == instrument)
    }
}

/// Finished decision work for one instrument
struct DecisionWork {
    instrument: String,
    missing_sources: Vec<String>,
    decision: Decision,
    outcome: Option<PipelineOutcome>,
}

enum EntrySettlement {
    Filled,
    Pending,
    Failed(String),
    /// Filled at the broker but could not be tracked as a position
    Untracked(Alert),
}

/// Runs the full decision cycle over a set of instruments.
///
/// Signal collection, voting and gating happen concurrently per instrument
/// under a cycle deadline while the lifecycle manager works open positions.
/// All risk state flows through the shared `RiskManager`.
pub struct DecisionEngine {
    config: Arc<PipelineConfig>,
    collector: Arc<SignalCollector>,
    voter: Arc<EnsembleVoter>,
    pipeline: Arc<GatePipeline>,
    risk: Arc<RiskManager>,
    lifecycle: Arc<PositionLifecycleManager>,
    gateway: Arc<dyn ExecutionGateway>,
    store: Arc<dyn StateStore>,
    pending_entries: DashMap<String, PendingEntry>,
    dirty: AtomicBool,
    metrics: Mutex<AgentMetrics>,
}

impl DecisionEngine {
    /// Validate config, wire components and load persisted state.
    ///
    /// A store that cannot be read is fatal: the engine never starts on an
    /// unknown risk state.
    pub async fn bootstrap(
        config: PipelineConfig,
        sources: Vec<Arc<dyn SignalSource>>,
        gateway: Arc<dyn ExecutionGateway>,
        store: Arc<dyn StateStore>,
    ) -> Result<Self> {
        config.validate().context("invalid pipeline configuration")?;
        let config = Arc::new(config);

        let mut collector = SignalCollector::new();
        for source in sources {
            let source_config = config
                .source_config(source.source_id())
                .ok_or_else(|| ConfigError::MissingSourceConfig(source.source_id().to_string()))?;
            collector.register(source, source_config);
        }

        let risk = Arc::new(RiskManager::new(
            config.risk.clone(),
            config.starting_equity,
            Utc::now().date_naive(),
        ));
        let lifecycle = Arc::new(PositionLifecycleManager::new(
            Arc::clone(&gateway),
            Arc::clone(&risk),
            config.max_exit_retries,
        ));

        let persisted = store
            .load()
            .await
            .context("loading persisted risk state")?;
        match persisted {
            Some(persisted) => {
                risk.restore(persisted.risk_state, &persisted.positions).await;
                lifecycle.restore(persisted.positions);
                tracing::info!("Resuming from state saved at {}", persisted.saved_at);
            }
            None => tracing::info!(
                "No persisted state, starting with ${} equity",
                config.starting_equity
            ),
        }

        let mut metrics = AgentMetrics::new(config.metrics_log_interval);
        match store.load_metrics().await {
            Ok(Some(saved)) => metrics.restore_from_json(&saved),
            Ok(None) => {}
            Err(e) => tracing::warn!("Could not load persisted metrics, starting fresh: {}", e),
        }

        let pipeline = GatePipeline::from_config(&config.gates, Arc::clone(&risk), Arc::clone(&config));
        tracing::info!(
            "Decision engine ready: {} sources, {} voting, gates [{}], broker {}",
            collector.len(),
            config.ensemble.mode,
            pipeline.gate_names().join(" > "),
            gateway.broker_name()
        );

        Ok(Self {
            voter: Arc::new(EnsembleVoter::new(config.ensemble.clone())),
            metrics: Mutex::new(metrics),
            collector: Arc::new(collector),
            pipeline: Arc::new(pipeline),
            config,
            risk,
            lifecycle,
            gateway,
            store,
            pending_entries: DashMap::new(),
            dirty: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Shared risk manager, for halt/resume and snapshots
    pub fn risk(&self) -> &Arc<RiskManager> {
        &self.risk
    }

    /// Lifecycle manager, for inspecting positions and `retry_exit`
    pub fn lifecycle(&self) -> &Arc<PositionLifecycleManager> {
        &self.lifecycle
    }

    pub fn pending_entry_count(&self) -> usize {
        self.pending_entries.len()
    }

    pub fn has_pending_entry(&self, instrument: &str) -> bool {
        self.pending_entries.contains_key(instrument)
    }

    /// True while state from a failed save has not been written yet
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    pub async fn metrics_json(&self) -> serde_json::Value {
        self.metrics.lock().await.to_json()
    }

    /// One full decision cycle.
    ///
    /// Fails only when state cannot be persisted; everything else degrades
    /// into the report.
    pub async fn run_cycle(&self, contexts: Vec<MarketContext>, now: DateTime<Utc>) -> Result<CycleReport> {
        let cycle_start = AgentMetrics::start_timer();

        // 1. Never trade on top of state the store has not seen
        if self.is_dirty() {
            self.persist()
                .await
                .context("flushing state from a previous failed save")?;
            tracing::info!("Flushed unsaved state from previous cycle");
        }

        // 2. Trading day
        if self.risk.roll_day_if_needed(now.date_naive()).await {
            tracing::info!("Rolled to trading day {}", now.date_naive());
        }

        // 3. Entry orders from earlier cycles
        let mut alerts = Vec::new();
        let (entries_filled, mut entries_failed) = self.poll_pending_entries(&mut alerts).await;

        // 4. Lifecycle and new decisions side by side
        let prices: HashMap<String, Decimal> = contexts
            .iter()
            .filter_map(|c| c.last_price.map(|p| (c.instrument.clone(), p)))
            .collect();
        let candidates: Vec<MarketContext> = contexts
            .into_iter()
            .filter(|c| {
                !self.lifecycle.has_position(&c.instrument)
                    && !self.pending_entries.contains_key(&c.instrument)
            })
            .collect();

        let lifecycle_timer = AgentMetrics::start_timer();
        let decision_timer = AgentMetrics::start_timer();
        let lifecycle_pass = async {
            let report = self.lifecycle.evaluate_all(&prices, now).await;
            self.metrics.lock().await.record_lifecycle_duration(lifecycle_timer);
            report
        };
        let decision_pass = async {
            let decided = self.decide(candidates, now).await;
            self.metrics.lock().await.record_decision_duration(decision_timer);
            decided
        };
        let (lifecycle_report, (finished, abandoned)) = tokio::join!(lifecycle_pass, decision_pass);

        // 5. Orders for approved entries
        let mut decisions = Vec::with_capacity(finished.len());
        for work in finished {
            let outcome = self.submit_entry(work, &mut entries_failed, &mut alerts).await;
            decisions.push(outcome);
        }

        // 6. Circuit breakers
        alerts.extend(lifecycle_report.alerts);
        alerts.extend(self.risk.run_circuit_breakers().await);
        for alert in &alerts {
            match alert.severity {
                AlertSeverity::Critical => tracing::error!("ALERT {}", alert.summary()),
                AlertSeverity::Warning => tracing::warn!("ALERT {}", alert.summary()),
                AlertSeverity::Info => tracing::info!("ALERT {}", alert.summary()),
            }
        }

        let report = CycleReport {
            started_at: now,
            duration_ms: cycle_start.elapsed().as_millis() as u64,
            decisions,
            entries_filled,
            entries_failed,
            transitions: lifecycle_report.transitions,
            abandoned,
            alerts,
        };
        self.record_metrics(&report, cycle_start).await;

        // 7. Persist
        if let Err(e) = self.persist().await {
            self.dirty.store(true, Ordering::SeqCst);
            tracing::error!("Failed to persist cycle state: {}", e);
            return Err(e).context("persisting risk state and positions");
        }

        tracing::info!(
            "Cycle done in {}ms: {} decisions, {} orders, {} transitions, {} abandoned, {} alerts",
            report.duration_ms,
            report.decisions.len(),
            report.decisions.iter().filter(|d| d.order_submitted).count(),
            report.transitions.len(),
            report.abandoned.len(),
            report.alerts.len()
        );

        Ok(report)
    }

    async fn persist(&self) -> Result<(), risk_manager::StorageError> {
        let state = self.risk.snapshot().await;
        let positions = self.lifecycle.positions_snapshot().await;
        self.store.save(&state, &positions).await?;
        self.dirty.store(false, Ordering::SeqCst);

        let metrics = self.metrics.lock().await.to_json();
        if let Err(e) = self.store.save_metrics(&metrics).await {
            tracing::warn!("Failed to persist metrics: {}", e);
        }
        Ok(())
    }

    /// Collect, vote and gate every candidate under the cycle deadline.
    /// Returns finished work sorted by instrument and the abandoned instruments.
    async fn decide(
        &self,
        candidates: Vec<MarketContext>,
        now: DateTime<Utc>,
    ) -> (Vec<DecisionWork>, Vec<String>) {
        let deadline =
            tokio::time::Instant::now() + Duration::from_millis(self.config.cycle_deadline_ms);
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_decisions));
        let mut in_flight: HashSet<String> = HashSet::new();
        let mut tasks = JoinSet::new();

        for market in candidates {
            if !in_flight.insert(market.instrument.clone()) {
                tracing::warn!("Duplicate market context for {}, ignoring", market.instrument);
                continue;
            }
            let semaphore = Arc::clone(&semaphore);
            let collector = Arc::clone(&self.collector);
            let voter = Arc::clone(&self.voter);
            let pipeline = Arc::clone(&self.pipeline);

            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok()?;
                let instrument = market.instrument.clone();

                let collected = collector.collect(&instrument, now).await;
                let decision = voter.vote(&instrument, &collected.votes, now);
                let outcome = if decision.is_actionable() {
                    Some(pipeline.evaluate(&decision, &market).await)
                } else {
                    None
                };

                let missing_sources = collected
                    .timed_out
                    .iter()
                    .chain(&collected.failed)
                    .chain(&collected.malformed)
                    .chain(&collected.below_floor)
                    .cloned()
                    .collect();
                Some(DecisionWork {
                    instrument,
                    missing_sources,
                    decision,
                    outcome,
                })
            });
        }

        let mut finished = Vec::new();
        loop {
            match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(Ok(Some(work)))) => {
                    in_flight.remove(&work.instrument);
                    finished.push(work);
                }
                Ok(Some(Ok(None))) => {}
                Ok(Some(Err(e))) => tracing::error!("Decision task failed: {}", e),
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(
                        "Cycle deadline of {}ms reached with {} decisions in flight",
                        self.config.cycle_deadline_ms,
                        in_flight.len()
                    );
                    tasks.abort_all();
                    while tasks.join_next().await.is_some() {}
                    break;
                }
            }
        }

        // Anything left either missed the deadline or died; its gate work is void
        let mut abandoned: Vec<String> = in_flight.into_iter().collect();
        abandoned.sort();
        for instrument in &abandoned {
            if self.risk.release_reservation(instrument).await {
                tracing::info!("Released reservation of abandoned decision for {}", instrument);
            }
        }

        finished.sort_by(|a, b| a.instrument.cmp(&b.instrument));
        (finished, abandoned)
    }

    async fn submit_entry(
        &self,
        work: DecisionWork,
        entries_failed: &mut Vec<String>,
        alerts: &mut Vec<Alert>,
    ) -> InstrumentOutcome {
        let DecisionWork {
            instrument,
            missing_sources,
            decision,
            outcome,
        } = work;
        let (approved, gate_results, size) = match outcome {
            Some(o) => (o.approved, o.results, o.size),
            None => (false, Vec::new(), None),
        };

        let mut result = InstrumentOutcome {
            instrument: instrument.clone(),
            decision,
            gate_results,
            approved,
            order_submitted: false,
            order_id: None,
            missing_sources,
        };

        if !approved {
            if let Some(blocking) = result.gate_results.last() {
                tracing::info!(
                    "{} {} blocked at {} gate: {}",
                    instrument,
                    result.decision.action,
                    blocking.gate_name,
                    blocking.reason
                );
            }
            return result;
        }

        let Some(size) = size else {
            tracing::warn!("{} approved without a position size, not trading", instrument);
            return result;
        };
        let (Some(order_side), Some(side)) = (
            OrderSide::from_action(result.decision.action),
            PositionSide::from_action(result.decision.action),
        ) else {
            self.risk.release_reservation(&instrument).await;
            return result;
        };
        let Some((asset_class, profile)) = self.config.exit_profile_for(&instrument) else {
            self.risk.release_reservation(&instrument).await;
            return result;
        };

        if !self.risk.commit_reservation(&instrument).await {
            tracing::warn!("{} lost its reservation before submission", instrument);
            return result;
        }

        let order = OrderRequest::market(&instrument, order_side, size.quantity);
        let handle = match self.gateway.submit_order(&order).await {
            Ok(handle) => handle,
            Err(e) => {
                tracing::warn!("Entry order for {} failed: {}", instrument, e);
                self.risk.cancel_entry(&instrument).await;
                entries_failed.push(instrument);
                return result;
            }
        };

        tracing::info!(
            "Submitted entry {} {} x{} (order {}, consensus {:.2}, confidence {:.2})",
            order_side.as_str(),
            instrument,
            size.quantity,
            handle.order_id,
            result.decision.consensus_score,
            result.decision.weighted_confidence
        );
        result.order_submitted = true;
        result.order_id = Some(handle.order_id.clone());

        let entry = PendingEntry {
            handle,
            side,
            size,
            asset_class,
            profile,
        };
        match self.settle_entry(&instrument, &entry).await {
            EntrySettlement::Filled => {}
            EntrySettlement::Pending => {
                self.pending_entries.insert(instrument, entry);
            }
            EntrySettlement::Failed(_) => entries_failed.push(instrument),
            EntrySettlement::Untracked(alert) => {
                alerts.push(alert);
                entries_failed.push(instrument);
            }
        }
        result
    }

    /// Check every pending entry order once
    async fn poll_pending_entries(&self, alerts: &mut Vec<Alert>) -> (Vec<String>, Vec<String>) {
        let mut filled = Vec::new();
        let mut failed = Vec::new();

        let pending: Vec<(String, PendingEntry)> = self
            .pending_entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        for (instrument, entry) in pending {
            match self.settle_entry(&instrument, &entry).await {
                EntrySettlement::Pending => continue,
                EntrySettlement::Filled => filled.push(instrument.clone()),
                EntrySettlement::Failed(_) => failed.push(instrument.clone()),
                EntrySettlement::Untracked(alert) => {
                    alerts.push(alert);
                    failed.push(instrument.clone());
                }
            }
            self.pending_entries.remove(&instrument);
        }

        filled.sort();
        failed.sort();
        (filled, failed)
    }

    /// Read the entry's fill and apply it: a fill opens the position, a
    /// failure returns the exposure.
    async fn settle_entry(&self, instrument: &str, entry: &PendingEntry) -> EntrySettlement {
        match self.gateway.get_fill(&entry.handle).await {
            Ok(FillStatus::Filled(fill)) => match self.open_from_fill(instrument, entry, fill).await {
                Ok(()) => EntrySettlement::Filled,
                Err(alert) => EntrySettlement::Untracked(alert),
            },
            Ok(FillStatus::Pending) => EntrySettlement::Pending,
            Err(GatewayError::Unavailable(reason)) => {
                tracing::warn!("Cannot check entry for {} yet: {}", instrument, reason);
                EntrySettlement::Pending
            }
            Ok(FillStatus::Failed { reason }) => {
                tracing::warn!("Entry for {} failed: {}", instrument, reason);
                self.risk.cancel_entry(instrument).await;
                EntrySettlement::Failed(reason)
            }
            Err(e) => {
                tracing::warn!("Entry for {} failed: {}", instrument, e);
                self.risk.cancel_entry(instrument).await;
                EntrySettlement::Failed(e.to_string())
            }
        }
    }

    /// Track the fill as a position and book its exposure. A fill that cannot
    /// be tracked books nothing and comes back as a critical alert.
    async fn open_from_fill(
        &self,
        instrument: &str,
        entry: &PendingEntry,
        fill: Fill,
    ) -> Result<(), Alert> {
        if fill.quantity != entry.size.quantity {
            tracing::warn!(
                "{} filled {} of {} requested units",
                instrument,
                fill.quantity,
                entry.size.quantity
            );
        }

        let position = Position::open(
            instrument,
            entry.asset_class,
            entry.side,
            fill.quantity,
            fill.price,
            fill.filled_at,
            &entry.profile,
        );
        if let Err(e) = self.lifecycle.open_position(position) {
            self.risk.cancel_entry(instrument).await;
            let message = format!(
                "entry order {} filled {} @ ${} but was not tracked: {}; reconcile with the broker",
                fill.order_id, fill.quantity, fill.price, e
            );
            tracing::error!("{}: {}", instrument, message);
            return Err(Alert::new(
                AlertKind::UntrackedFill,
                AlertSeverity::Critical,
                false,
                Some(instrument.to_string()),
                message,
                self.risk.snapshot().await,
            ));
        }
        self.risk
            .update_on_fill(&FillEvent::Entry {
                instrument: instrument.to_string(),
                notional: fill.notional(),
            })
            .await;
        Ok(())
    }

    async fn record_metrics(&self, report: &CycleReport, cycle_start: std::time::Instant) {
        let mut metrics = self.metrics.lock().await;

        for outcome in &report.decisions {
            metrics.decisions_made += 1;
            if outcome.decision.is_actionable() {
                metrics.actionable_decisions += 1;
            }
            if outcome.approved {
                metrics.pipeline_approvals += 1;
            }
            for result in &outcome.gate_results {
                metrics.record_gate(&result.gate_name, result.verdict);
            }
            if outcome.order_submitted {
                metrics.entries_submitted += 1;
            }
        }
        metrics.entries_failed += report.entries_failed.len() as u64;
        metrics.decisions_abandoned += report.abandoned.len() as u64;
        metrics.alerts_raised += report.alerts.len() as u64;

        for transition in &report.transitions {
            match transition.to {
                PositionState::ExitPending => metrics.exits_triggered += 1,
                PositionState::Closed => {
                    let pnl = transition
                        .realized_pnl
                        .and_then(|p| p.to_f64())
                        .unwrap_or(0.0);
                    metrics.record_trade_result(pnl);
                }
                PositionState::Open => {}
            }
        }

        metrics.finish_cycle(cycle_start);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use broker_trait::{PaperBehavior, PaperGateway};
    use ensemble_voter::SourceConfig;
    use risk_manager::{
        ExposureStatus, MemoryStateStore, PersistedState, RiskState, StorageError,
    };
    use rust_decimal_macros::dec;
    use trading_core::{Action, RawVote, SignalError, SourceSchema};

    use crate::gates::RISK_SIZING_GATE;
    use crate::types::GateVerdict;

    struct ScoreSource {
        id: String,
        score: f64,
        delay_ms: u64,
    }

    #[async_trait]
    impl SignalSource for ScoreSource {
        fn source_id(&self) -> &str {
            &self.id
        }

        async fn get_vote(&self, _instrument: &str, _as_of: DateTime<Utc>) -> Result<RawVote, SignalError> {
            if self.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            }
            Ok(RawVote::Score { score: self.score })
        }
    }

    /// Store whose writes can be switched off
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStateStore,
        failing: AtomicBool,
        fail_loads: bool,
    }

    #[async_trait]
    impl StateStore for FlakyStore {
        async fn load(&self) -> Result<Option<PersistedState>, StorageError> {
            if self.fail_loads {
                return Err(StorageError::Unavailable("disk gone".to_string()));
            }
            self.inner.load().await
        }

        async fn save(&self, state: &RiskState, positions: &[Position]) -> Result<(), StorageError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(StorageError::Unavailable("disk full".to_string()));
            }
            self.inner.save(state, positions).await
        }

        async fn save_metrics(&self, metrics: &serde_json::Value) -> Result<(), StorageError> {
            self.inner.save_metrics(metrics).await
        }

        async fn load_metrics(&self) -> Result<Option<serde_json::Value>, StorageError> {
            self.inner.load_metrics().await
        }
    }

    fn source(id: &str, score: f64, delay_ms: u64) -> Arc<dyn SignalSource> {
        Arc::new(ScoreSource {
            id: id.to_string(),
            score,
            delay_ms,
        })
    }

    fn config() -> PipelineConfig {
        let mut config = PipelineConfig {
            sources: ["momentum", "rl_filter", "sentiment"]
                .iter()
                .map(|id| SourceConfig::new(*id, SourceSchema::signed_unit(0.1)))
                .collect(),
            ..PipelineConfig::default()
        };
        config.ensemble.weights = HashMap::from([
            ("momentum".to_string(), 0.4),
            ("rl_filter".to_string(), 0.35),
            ("sentiment".to_string(), 0.25),
        ]);
        config
    }

    fn bullish_sources() -> Vec<Arc<dyn SignalSource>> {
        vec![
            source("momentum", 0.9, 0),
            source("rl_filter", 0.8, 0),
            source("sentiment", 0.7, 0),
        ]
    }

    fn bullish_market(instrument: &str, price: Decimal) -> MarketContext {
        MarketContext::new(instrument, Utc::now())
            .with_price(price)
            .with_momentum(0.5, 55.0, 1.4)
            .with_sentiment(0.2)
    }

    async fn engine_with(
        config: PipelineConfig,
        sources: Vec<Arc<dyn SignalSource>>,
        gateway: Arc<PaperGateway>,
        store: Arc<dyn StateStore>,
    ) -> DecisionEngine {
        DecisionEngine::bootstrap(config, sources, gateway as Arc<dyn ExecutionGateway>, store)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn approved_buy_opens_a_sized_position() {
        let gateway = Arc::new(PaperGateway::new());
        gateway.set_price("AAPL", dec!(100));
        let store = Arc::new(MemoryStateStore::new());
        let engine = engine_with(config(), bullish_sources(), gateway.clone(), store.clone()).await;

        let report = engine
            .run_cycle(vec![bullish_market("AAPL", dec!(100))], Utc::now())
            .await
            .unwrap();

        let outcome = report.outcome("AAPL").unwrap();
        assert_eq!(outcome.decision.action, Action::Buy);
        assert!(outcome.approved);
        assert!(outcome.order_submitted);
        assert_eq!(outcome.gate_results.len(), 4);

        // min(20% of 100k, 1% of 100k / 2% stop) = $20k at $100
        let position = engine.lifecycle().position("AAPL").await.unwrap();
        assert_eq!(position.quantity, dec!(200));
        assert_eq!(position.side, PositionSide::Long);
        assert_eq!(
            engine.risk().exposure_for("AAPL").await.map(|e| e.status),
            Some(ExposureStatus::Open)
        );

        let saved = store.load().await.unwrap().unwrap();
        assert_eq!(saved.positions.len(), 1);
        assert_eq!(engine.metrics_json().await["entries_submitted"], 1);
    }

    #[tokio::test]
    async fn pending_entry_opens_when_filled_later() {
        let gateway = Arc::new(PaperGateway::new());
        gateway.set_price("MSFT", dec!(400));
        gateway.set_behavior("MSFT", PaperBehavior::StayPending);
        let engine = engine_with(
            config(),
            bullish_sources(),
            gateway.clone(),
            Arc::new(MemoryStateStore::new()),
        )
        .await;

        let report = engine
            .run_cycle(vec![bullish_market("MSFT", dec!(400))], Utc::now())
            .await
            .unwrap();
        let order_id = report.outcome("MSFT").and_then(|o| o.order_id.clone()).unwrap();
        assert!(engine.has_pending_entry("MSFT"));
        assert!(!engine.lifecycle().has_position("MSFT"));
        assert_eq!(
            engine.risk().exposure_for("MSFT").await.map(|e| e.status),
            Some(ExposureStatus::Committed)
        );

        // Still pending: no second decision for the same instrument
        let report = engine
            .run_cycle(vec![bullish_market("MSFT", dec!(400))], Utc::now())
            .await
            .unwrap();
        assert!(report.decisions.is_empty());
        assert_eq!(gateway.submission_count(), 1);

        gateway.fill_pending(&order_id).unwrap();
        let report = engine.run_cycle(Vec::new(), Utc::now()).await.unwrap();
        assert_eq!(report.entries_filled, vec!["MSFT".to_string()]);
        assert!(engine.lifecycle().has_position("MSFT"));
        assert_eq!(engine.pending_entry_count(), 0);
    }

    #[tokio::test]
    async fn fill_without_a_trackable_position_books_nothing_and_alerts() {
        let gateway = Arc::new(PaperGateway::new());
        gateway.set_price("MSFT", dec!(400));
        gateway.set_behavior("MSFT", PaperBehavior::StayPending);
        let engine = engine_with(
            config(),
            bullish_sources(),
            gateway.clone(),
            Arc::new(MemoryStateStore::new()),
        )
        .await;

        let report = engine
            .run_cycle(vec![bullish_market("MSFT", dec!(400))], Utc::now())
            .await
            .unwrap();
        let order_id = report.outcome("MSFT").and_then(|o| o.order_id.clone()).unwrap();

        // Something else started tracking MSFT while the entry was working
        engine
            .lifecycle()
            .open_position(Position::open(
                "MSFT",
                AssetClass::Equity,
                PositionSide::Long,
                dec!(5),
                dec!(400),
                Utc::now(),
                &ExitProfile::new(0.03, 0.02, 20),
            ))
            .unwrap();

        gateway.fill_pending(&order_id).unwrap();
        let report = engine.run_cycle(Vec::new(), Utc::now()).await.unwrap();

        assert!(report.entries_filled.is_empty());
        assert_eq!(report.entries_failed, vec!["MSFT".to_string()]);
        let alert = report
            .alerts
            .iter()
            .find(|a| a.kind == AlertKind::UntrackedFill)
            .unwrap();
        assert_eq!(alert.severity, AlertSeverity::Critical);
        assert_eq!(alert.instrument.as_deref(), Some("MSFT"));

        assert!(engine.risk().exposure_for("MSFT").await.is_none());
        assert_eq!(engine.pending_entry_count(), 0);
        assert_eq!(engine.lifecycle().position("MSFT").await.unwrap().quantity, dec!(5));
    }

    #[tokio::test]
    async fn metrics_survive_a_restart() {
        let gateway = Arc::new(PaperGateway::new());
        gateway.set_price("AAPL", dec!(100));
        let store = Arc::new(MemoryStateStore::new());
        let engine = engine_with(config(), bullish_sources(), gateway.clone(), store.clone()).await;
        engine
            .run_cycle(vec![bullish_market("AAPL", dec!(100))], Utc::now())
            .await
            .unwrap();
        drop(engine);

        let restarted = engine_with(config(), bullish_sources(), gateway, store).await;
        let metrics = restarted.metrics_json().await;
        assert_eq!(metrics["cycles_run"], 1);
        assert_eq!(metrics["entries_submitted"], 1);
        assert!(restarted.lifecycle().has_position("AAPL"));
    }

    #[tokio::test]
    async fn rejected_entry_returns_exposure() {
        let gateway = Arc::new(PaperGateway::new());
        gateway.set_price("GLD", dec!(180));
        gateway.set_behavior("GLD", PaperBehavior::RejectSubmissions);
        let engine = engine_with(
            config(),
            bullish_sources(),
            gateway.clone(),
            Arc::new(MemoryStateStore::new()),
        )
        .await;

        let report = engine
            .run_cycle(vec![bullish_market("GLD", dec!(180))], Utc::now())
            .await
            .unwrap();
        assert_eq!(report.entries_failed, vec!["GLD".to_string()]);
        assert!(!report.outcome("GLD").unwrap().order_submitted);
        assert!(engine.risk().exposure_for("GLD").await.is_none());
        assert_eq!(engine.risk().open_exposure().await, Decimal::ZERO);
    }

    #[tokio::test]
    async fn hold_and_gate_rejections_never_trade() {
        let gateway = Arc::new(PaperGateway::new());
        gateway.set_price("SPY", dec!(500));
        gateway.set_price("QQQ", dec!(430));
        let sources = vec![
            source("momentum", 0.05, 0),
            source("rl_filter", 0.02, 0),
            source("sentiment", -0.04, 0),
        ];
        let engine = engine_with(config(), sources, gateway.clone(), Arc::new(MemoryStateStore::new())).await;

        let report = engine
            .run_cycle(vec![bullish_market("SPY", dec!(500))], Utc::now())
            .await
            .unwrap();
        let outcome = report.outcome("SPY").unwrap();
        assert_eq!(outcome.decision.action, Action::Hold);
        assert!(outcome.gate_results.is_empty());

        // Bullish votes into bad news
        let engine = engine_with(
            config(),
            bullish_sources(),
            gateway.clone(),
            Arc::new(MemoryStateStore::new()),
        )
        .await;
        let market = bullish_market("QQQ", dec!(430)).with_sentiment(-0.8);
        let report = engine.run_cycle(vec![market], Utc::now()).await.unwrap();
        let outcome = report.outcome("QQQ").unwrap();
        assert!(!outcome.approved);
        assert_eq!(outcome.gate_results.last().map(|r| r.gate_name.as_str()), Some("sentiment"));
        assert_eq!(gateway.submission_count(), 0);
    }

    #[tokio::test]
    async fn slow_decisions_are_abandoned_at_the_deadline() {
        let gateway = Arc::new(PaperGateway::new());
        gateway.set_price("NVDA", dec!(120));
        let mut config = config();
        config.cycle_deadline_ms = 50;
        let sources = vec![
            source("momentum", 0.9, 500),
            source("rl_filter", 0.8, 500),
            source("sentiment", 0.7, 500),
        ];
        let engine = engine_with(config, sources, gateway.clone(), Arc::new(MemoryStateStore::new())).await;

        let report = engine
            .run_cycle(vec![bullish_market("NVDA", dec!(120))], Utc::now())
            .await
            .unwrap();
        assert_eq!(report.abandoned, vec!["NVDA".to_string()]);
        assert!(report.decisions.is_empty());
        assert_eq!(gateway.submission_count(), 0);
        assert_eq!(engine.risk().open_exposure().await, Decimal::ZERO);
    }

    #[tokio::test]
    async fn timed_out_source_is_reported_missing() {
        let gateway = Arc::new(PaperGateway::new());
        gateway.set_price("AMD", dec!(150));
        let mut config = config();
        config.sources[2] = config.sources[2].clone().with_timeout_ms(20);
        let sources = vec![
            source("momentum", 0.9, 0),
            source("rl_filter", 0.8, 0),
            source("sentiment", 0.7, 300),
        ];
        let engine = engine_with(config, sources, gateway, Arc::new(MemoryStateStore::new())).await;

        let report = engine
            .run_cycle(vec![bullish_market("AMD", dec!(150))], Utc::now())
            .await
            .unwrap();
        let outcome = report.outcome("AMD").unwrap();
        assert_eq!(outcome.missing_sources, vec!["sentiment".to_string()]);
        assert_eq!(outcome.decision.per_source_votes.len(), 2);
        assert_eq!(outcome.decision.action, Action::Buy);
    }

    #[tokio::test]
    async fn failed_save_marks_state_dirty_and_is_flushed_next_cycle() {
        let gateway = Arc::new(PaperGateway::new());
        let store = Arc::new(FlakyStore::default());
        let engine = engine_with(config(), bullish_sources(), gateway, store.clone()).await;

        store.failing.store(true, Ordering::SeqCst);
        assert!(engine.run_cycle(Vec::new(), Utc::now()).await.is_err());
        assert!(engine.is_dirty());

        // Still failing: the cycle aborts before doing anything
        assert!(engine.run_cycle(Vec::new(), Utc::now()).await.is_err());

        store.failing.store(false, Ordering::SeqCst);
        engine.run_cycle(Vec::new(), Utc::now()).await.unwrap();
        assert!(!engine.is_dirty());
        assert!(store.load().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn unreadable_store_is_fatal_at_bootstrap() {
        let store = Arc::new(FlakyStore {
            fail_loads: true,
            ..FlakyStore::default()
        });
        let result = DecisionEngine::bootstrap(
            config(),
            bullish_sources(),
            Arc::new(PaperGateway::new()),
            store,
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn unregistered_source_is_a_config_error() {
        let mut sources = bullish_sources();
        sources.push(source("unknown_model", 0.5, 0));
        let result = DecisionEngine::bootstrap(
            config(),
            sources,
            Arc::new(PaperGateway::new()),
            Arc::new(MemoryStateStore::new()),
        )
        .await;
        let err = result.err().unwrap();
        assert_eq!(
            err.downcast_ref::<ConfigError>(),
            Some(&ConfigError::MissingSourceConfig("unknown_model".to_string()))
        );
    }

    #[tokio::test]
    async fn restored_halt_blocks_entries_and_positions_keep_running() {
        let mut state = RiskState::new(dec!(97900), Utc::now().date_naive());
        state.trading_halted = true;
        state.halt_reason = Some(risk_manager::HaltReason::DailyLossLimit);
        let held = Position::open(
            "TLT",
            AssetClass::LowVolatility,
            PositionSide::Long,
            dec!(50),
            dec!(90),
            Utc::now(),
            &ExitProfile::new(0.004, 0.003, 6),
        );
        let store = Arc::new(MemoryStateStore::with_state(PersistedState {
            risk_state: state,
            positions: vec![held],
            saved_at: Utc::now(),
        }));

        let gateway = Arc::new(PaperGateway::new());
        gateway.set_price("TLT", dec!(85));
        gateway.set_price("AAPL", dec!(100));
        let engine = engine_with(config(), bullish_sources(), gateway.clone(), store).await;
        assert!(engine.lifecycle().has_position("TLT"));

        let market = vec![
            bullish_market("AAPL", dec!(100)),
            MarketContext::new("TLT", Utc::now()).with_price(dec!(85)),
        ];
        let report = engine.run_cycle(market, Utc::now()).await.unwrap();

        // TLT is held, so only AAPL is decided, and the halt rejects it
        assert_eq!(report.decisions.len(), 1);
        let blocking = report.outcome("AAPL").unwrap().gate_results.last().unwrap();
        assert_eq!(blocking.gate_name, RISK_SIZING_GATE);
        assert_eq!(blocking.verdict, GateVerdict::Reject);

        // Stop hit on the held position closes it despite the halt
        assert_eq!(report.transitions.last().map(|t| t.to), Some(PositionState::Closed));
        assert!(!engine.lifecycle().has_position("TLT"));
    }
}
