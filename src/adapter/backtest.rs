//! Backtest Adapter
//!
//! Fills every accepted order immediately at the caller-provided mark,
//! adjusted by the shared fee/slippage models, on the caller's sim clock.
//! No wall-clock, no wire, no entropy: identical inputs produce identical
//! fills.

use crate::adapter::{
    apply_fill_to_positions, normalize_order, record_submit_metrics, AdapterEvent,
    AdapterEventKind, AdapterEventLog, AdapterLimiter, FillSynth, OrderAdapter, SymbolFilters,
};
use crate::config::Config;
use crate::errors::PipelineError;
use crate::metrics;
use crate::models::{Fill, Millis, Order, Scenario};
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use tracing::debug;

pub struct BacktestAdapter {
    synth: FillSynth,
    limiter: AdapterLimiter,
    pending_fills: Vec<Fill>,
    positions: HashMap<String, f64>,
    events: Option<AdapterEventLog>,
    accepted: HashMap<String, Millis>,
}

impl BacktestAdapter {
    pub fn new(cfg: &Config, events: Option<AdapterEventLog>) -> Self {
        Self {
            synth: FillSynth::new(&cfg.backtest),
            limiter: AdapterLimiter::new(&cfg.adapter.rate_limit),
            pending_fills: Vec::new(),
            positions: HashMap::new(),
            events,
            accepted: HashMap::new(),
        }
    }

    /// Advance the adapter's view of the market. Must be called before
    /// submitting orders for the symbol.
    pub fn set_mark(
        &mut self,
        symbol: &str,
        ts_ms: Millis,
        mid: f64,
        scenario: Option<Scenario>,
        spread_bps: f64,
    ) {
        self.synth.set_mark(symbol, ts_ms, mid, scenario, spread_bps);
    }

    fn record_event(&mut self, kind: AdapterEventKind, order: &Order, detail: serde_json::Value) {
        if let Some(log) = self.events.as_mut() {
            let _ = log.record(&AdapterEvent {
                ts_ms: self.synth.now_ms(),
                kind,
                client_order_id: order.client_order_id.clone(),
                symbol: order.symbol.clone(),
                detail,
            });
        }
    }
}

#[async_trait]
impl OrderAdapter for BacktestAdapter {
    async fn submit(&mut self, mut order: Order) -> Result<String, PipelineError> {
        self.record_event(AdapterEventKind::Submit, &order, json!({"qty": order.qty}));

        let filters = SymbolFilters::for_symbol(&order.symbol);
        if let Err(e) = normalize_order(&mut order, &filters) {
            record_submit_metrics("rejected", "validation");
            self.record_event(AdapterEventKind::Reject, &order, json!({"error": e.to_string()}));
            return Err(e);
        }

        if !self.limiter.place.try_acquire(self.synth.now_ms()) {
            metrics::global().incr(&metrics::labelled(
                metrics::EXECUTOR_THROTTLE_TOTAL,
                &[("reason", "place")],
            ));
            record_submit_metrics("rejected", "rate_limited");
            self.record_event(AdapterEventKind::Reject, &order, json!({"error": "rate limited"}));
            return Err(PipelineError::RateLimited(format!(
                "place bucket empty for {}",
                order.client_order_id
            )));
        }

        if self.accepted.contains_key(&order.client_order_id) {
            record_submit_metrics("rejected", "duplicate");
            self.record_event(
                AdapterEventKind::Reject,
                &order,
                json!({"error": "duplicate client_order_id"}),
            );
            return Err(PipelineError::AdapterRejected(format!(
                "duplicate client_order_id {}",
                order.client_order_id
            )));
        }

        let fill = match self.synth.synthesize(&order) {
            Ok(fill) => fill,
            Err(e) => {
                record_submit_metrics("rejected", "no_price");
                self.record_event(AdapterEventKind::Reject, &order, json!({"error": e.to_string()}));
                return Err(e);
            }
        };

        self.record_event(AdapterEventKind::Ack, &order, json!({}));
        self.record_event(
            AdapterEventKind::Fill,
            &order,
            json!({"exec_price": fill.exec_price, "fee": fill.fee}),
        );
        record_submit_metrics("ok", "");
        metrics::global().observe_latency(metrics::EXECUTOR_LATENCY_SECONDS, 0);

        apply_fill_to_positions(&mut self.positions, &fill);
        self.accepted
            .insert(order.client_order_id.clone(), self.synth.now_ms());
        self.pending_fills.push(fill);
        debug!(client_order_id = %order.client_order_id, "backtest fill");
        Ok(order.client_order_id)
    }

    async fn cancel(&mut self, client_order_id: &str) -> Result<(), PipelineError> {
        if !self.limiter.cancel.try_acquire(self.synth.now_ms()) {
            metrics::global().incr(&metrics::labelled(
                metrics::EXECUTOR_THROTTLE_TOTAL,
                &[("reason", "cancel")],
            ));
            return Err(PipelineError::RateLimited(format!(
                "cancel bucket empty for {}",
                client_order_id
            )));
        }
        // Everything fills instantly in backtest; nothing is open to cancel.
        Err(PipelineError::AdapterRejected(format!(
            "{}: no open order to cancel",
            client_order_id
        )))
    }

    fn fetch_fills(&mut self) -> Vec<Fill> {
        std::mem::take(&mut self.pending_fills)
    }

    fn positions(&self) -> HashMap<String, f64> {
        self.positions.clone()
    }

    async fn close(&mut self) -> Result<(), PipelineError> {
        if let Some(log) = self.events.as_mut() {
            log.sync_all()
                .map_err(|e| PipelineError::SinkWriteFailed(e.to_string()))?;
        }
        Ok(())
    }
}
