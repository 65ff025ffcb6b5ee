//! Metrics collection for observability
//!
//! This module provides Prometheus metrics for monitoring the ledger.
//!
//! # Metrics
//!
//! - `atom_store_inserts_total` - Atoms written for the first time
//! - `atom_store_status_updates_total` - Status transitions written
//! - `ledger_finality_promotions_total` - STORED/EVICTED atoms promoted to FINAL
//! - `account_system_errors_total` - Account system failures (isolated per system)
//! - `account_observation_seconds` - Histogram of per-observation fan-out latency
//! - `ledger_network_subscriptions` - Open per-address network subscriptions

use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Atoms inserted
    pub atoms_inserted: IntCounter,

    /// Status updates written
    pub status_updates: IntCounter,

    /// Finality promotions
    pub finality_promotions: IntCounter,

    /// Account system failures
    pub account_system_errors: IntCounter,

    /// Fan-out duration histogram
    pub observation_duration: Histogram,

    /// Open network subscriptions
    pub network_subscriptions: IntGauge,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector with its own registry
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let atoms_inserted = IntCounter::new(
            "atom_store_inserts_total",
            "Atoms written for the first time",
        )?;
        registry.register(Box::new(atoms_inserted.clone()))?;

        let status_updates = IntCounter::new(
            "atom_store_status_updates_total",
            "Atom status transitions written",
        )?;
        registry.register(Box::new(status_updates.clone()))?;

        let finality_promotions = IntCounter::new(
            "ledger_finality_promotions_total",
            "Atoms promoted to a FINAL status",
        )?;
        registry.register(Box::new(finality_promotions.clone()))?;

        let account_system_errors = IntCounter::new(
            "account_system_errors_total",
            "Account system failures while processing an observation",
        )?;
        registry.register(Box::new(account_system_errors.clone()))?;

        let observation_duration = Histogram::with_opts(
            HistogramOpts::new(
                "account_observation_seconds",
                "Histogram of per-observation fan-out latency",
            )
            .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.010, 0.050, 0.100, 0.500, 1.0]),
        )?;
        registry.register(Box::new(observation_duration.clone()))?;

        let network_subscriptions = IntGauge::new(
            "ledger_network_subscriptions",
            "Open per-address network subscriptions",
        )?;
        registry.register(Box::new(network_subscriptions.clone()))?;

        Ok(Self {
            atoms_inserted,
            status_updates,
            finality_promotions,
            account_system_errors,
            observation_duration,
            network_subscriptions,
            registry,
        })
    }

    /// Record atom insert
    pub fn record_atom_inserted(&self) {
        self.atoms_inserted.inc();
    }

    /// Record status update
    pub fn record_status_update(&self) {
        self.status_updates.inc();
    }

    /// Record finality promotion
    pub fn record_finality_promotion(&self) {
        self.finality_promotions.inc();
    }

    /// Record account system failure
    pub fn record_account_system_error(&self) {
        self.account_system_errors.inc();
    }

    /// Record fan-out duration
    pub fn record_observation_duration(&self, duration_seconds: f64) {
        self.observation_duration.observe(duration_seconds);
    }

    /// Network subscription opened
    pub fn subscription_opened(&self) {
        self.network_subscriptions.inc();
    }

    /// Network subscription closed
    pub fn subscription_closed(&self) {
        self.network_subscriptions.dec();
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("atoms_inserted", &self.atoms_inserted.get())
            .field("status_updates", &self.status_updates.get())
            .field("finality_promotions", &self.finality_promotions.get())
            .finish()
    }
}
