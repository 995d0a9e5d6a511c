//! Workload cost model
//!
//! A workload is priced on the smallest catalog shape covering its total
//! request (`request × replicas`), billed in proportion to the share of the
//! shape it occupies. Without resolved prices the static per-resource
//! estimate is used instead.

use crate::models::CostEstimate;
use crate::pricing::{
    fallback_hourly, PriceBook, PriceSource, DEFAULT_SPOT_DISCOUNT, HOURS_PER_MONTH,
};
use crate::units::GIB;

/// Round a currency amount to cents
pub fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Resource demand of a workload
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Demand {
    pub cpu_millicores_per_replica: u64,
    pub memory_bytes_per_replica: u64,
    pub replicas: u32,
}

impl Demand {
    pub fn total_cpu_cores(&self) -> f64 {
        self.cpu_millicores_per_replica as f64 * self.replicas as f64 / 1000.0
    }

    pub fn total_memory_gb(&self) -> f64 {
        self.memory_bytes_per_replica as f64 * self.replicas as f64 / GIB as f64
    }
}

/// Prices demands against a price book
pub struct CostModel<'a> {
    book: &'a PriceBook,
    spot_discount: f64,
}

impl<'a> CostModel<'a> {
    pub fn new(book: &'a PriceBook) -> Self {
        Self {
            book,
            spot_discount: DEFAULT_SPOT_DISCOUNT,
        }
    }

    pub fn with_spot_discount(mut self, discount: f64) -> Self {
        self.spot_discount = discount.clamp(0.0, 1.0);
        self
    }

    /// On-demand cost of a demand
    pub fn on_demand(&self, demand: &Demand) -> CostEstimate {
        self.estimate(demand, false)
    }

    /// Cost of a demand on spot capacity
    pub fn spot(&self, demand: &Demand) -> CostEstimate {
        self.estimate(demand, true)
    }

    /// Cost of a single node of the given instance type
    pub fn node_hourly(&self, instance_type: Option<&str>, cpu_cores: f64, memory_gb: f64) -> f64 {
        instance_type
            .and_then(|t| self.book.shape(t))
            .map(|s| s.price.on_demand)
            .unwrap_or_else(|| fallback_hourly(cpu_cores, memory_gb))
    }

    fn estimate(&self, demand: &Demand, spot: bool) -> CostEstimate {
        let cpu = demand.total_cpu_cores();
        let mem = demand.total_memory_gb();

        let (hourly, instance_type, source) = match self.book.covering_shape(cpu, mem) {
            Some(priced) if !self.book.is_fallback() => {
                let share = (cpu / priced.shape.cpu_cores).max(mem / priced.shape.memory_gb);
                let unit = if spot {
                    priced
                        .price
                        .spot
                        .unwrap_or(priced.price.on_demand * (1.0 - self.spot_discount))
                } else {
                    priced.price.on_demand
                };
                (unit * share, Some(priced.shape.name.clone()), PriceSource::Resolver)
            }
            _ => {
                let base = fallback_hourly(cpu, mem);
                let hourly = if spot { base * (1.0 - self.spot_discount) } else { base };
                (hourly, None, PriceSource::Fallback)
            }
        };

        CostEstimate {
            hourly: (hourly * 10_000.0).round() / 10_000.0,
            monthly: round_cents(hourly * HOURS_PER_MONTH),
            instance_type,
            source,
        }
    }
}

/// Savings between two estimates: (monthly, yearly, percentage)
pub fn savings(current: &CostEstimate, optimized: &CostEstimate) -> (f64, f64, f64) {
    let monthly = round_cents((current.monthly - optimized.monthly).max(0.0));
    let pct = if current.monthly > 0.0 {
        ((monthly / current.monthly) * 1000.0).round() / 10.0
    } else {
        0.0
    };
    (monthly, round_cents(monthly * 12.0), pct)
}
