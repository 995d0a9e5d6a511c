//! Pricing Resolver contract and built-in provider catalogs
//!
//! The engine never talks to a pricing backend directly. Before each
//! analysis the controller resolves a [`PriceBook`] (bounded by a timeout),
//! and the engine prices workloads against that snapshot. When the resolver
//! is unreachable the book falls back to a static per-resource estimate.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{OptimizerError, Result};

/// Hours per month used for every monthly figure
pub const HOURS_PER_MONTH: f64 = 730.0;

/// Fallback hourly price of one CPU core
pub const FALLBACK_CPU_CORE_HOURLY: f64 = 0.04;

/// Fallback hourly price of one GiB of memory
pub const FALLBACK_MEMORY_GB_HOURLY: f64 = 0.005;

/// Discount applied when no spot price is published
pub const DEFAULT_SPOT_DISCOUNT: f64 = 0.65;

/// Cloud providers with a built-in catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[default]
    Aws,
    Gcp,
    Azure,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Aws => "aws",
            Provider::Gcp => "gcp",
            Provider::Azure => "azure",
        }
    }

    /// Node selector pinning pods to spot capacity on this provider
    pub fn spot_node_selector(&self) -> (&'static str, &'static str) {
        match self {
            Provider::Aws => ("eks.amazonaws.com/capacityType", "SPOT"),
            Provider::Gcp => ("cloud.google.com/gke-spot", "true"),
            Provider::Azure => ("kubernetes.azure.com/scalesetpriority", "spot"),
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "aws" => Ok(Provider::Aws),
            "gcp" => Ok(Provider::Gcp),
            "azure" => Ok(Provider::Azure),
            other => Err(format!("unknown provider '{}'", other)),
        }
    }
}

/// Where a price came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceSource {
    Resolver,
    Fallback,
}

/// Compute capacity of an instance shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceShape {
    pub name: String,
    pub cpu_cores: f64,
    pub memory_gb: f64,
}

/// Hourly unit prices of one shape
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitPrice {
    pub on_demand: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spot: Option<f64>,
}

/// name, vCPU, memory GiB, on-demand USD/hour
type CatalogRow = (&'static str, f64, f64, f64);

const AWS_CATALOG: &[CatalogRow] = &[
    ("t3.micro", 2.0, 1.0, 0.0104),
    ("t3.small", 2.0, 2.0, 0.0208),
    ("t3.medium", 2.0, 4.0, 0.0416),
    ("t3.large", 2.0, 8.0, 0.0832),
    ("c5.large", 2.0, 4.0, 0.085),
    ("m5.large", 2.0, 8.0, 0.096),
    ("c5.xlarge", 4.0, 8.0, 0.17),
    ("m5.xlarge", 4.0, 16.0, 0.192),
    ("c5.2xlarge", 8.0, 16.0, 0.34),
    ("m5.2xlarge", 8.0, 32.0, 0.384),
];

const GCP_CATALOG: &[CatalogRow] = &[
    ("e2-micro", 2.0, 1.0, 0.0084),
    ("e2-small", 2.0, 2.0, 0.0168),
    ("e2-medium", 2.0, 4.0, 0.0336),
    ("n1-standard-1", 1.0, 3.75, 0.0475),
    ("n1-standard-2", 2.0, 7.5, 0.095),
    ("n2-standard-2", 2.0, 8.0, 0.0971),
    ("n1-standard-4", 4.0, 15.0, 0.19),
    ("n2-standard-4", 4.0, 16.0, 0.1942),
    ("n2-standard-8", 8.0, 32.0, 0.3884),
];

const AZURE_CATALOG: &[CatalogRow] = &[
    ("Standard_B1s", 1.0, 1.0, 0.0104),
    ("Standard_B2s", 2.0, 4.0, 0.0416),
    ("Standard_B2ms", 2.0, 8.0, 0.0832),
    ("Standard_F2s_v2", 2.0, 4.0, 0.085),
    ("Standard_D2s_v3", 2.0, 8.0, 0.096),
    ("Standard_F4s_v2", 4.0, 8.0, 0.169),
    ("Standard_D4s_v3", 4.0, 16.0, 0.192),
    ("Standard_F8s_v2", 8.0, 16.0, 0.338),
    ("Standard_D8s_v3", 8.0, 32.0, 0.384),
];

fn catalog_rows(provider: Provider) -> &'static [CatalogRow] {
    match provider {
        Provider::Aws => AWS_CATALOG,
        Provider::Gcp => GCP_CATALOG,
        Provider::Azure => AZURE_CATALOG,
    }
}

/// Instance shapes known for a provider
pub fn catalog(provider: Provider) -> Vec<InstanceShape> {
    catalog_rows(provider)
        .iter()
        .map(|(name, cpu, mem, _)| InstanceShape {
            name: name.to_string(),
            cpu_cores: *cpu,
            memory_gb: *mem,
        })
        .collect()
}

/// Source of unit prices for instance shapes
#[async_trait]
pub trait PricingResolver: Send + Sync {
    /// Get on-demand (and, if published, spot) hourly price of a shape
    async fn get_unit_price(
        &self,
        provider: Provider,
        shape: &InstanceShape,
        region: &str,
    ) -> Result<UnitPrice>;
}

/// Resolver answering from the built-in on-demand price tables
#[derive(Debug, Clone, Default)]
pub struct StaticPriceCatalog;

#[async_trait]
impl PricingResolver for StaticPriceCatalog {
    async fn get_unit_price(
        &self,
        provider: Provider,
        shape: &InstanceShape,
        _region: &str,
    ) -> Result<UnitPrice> {
        catalog_rows(provider)
            .iter()
            .find(|(name, ..)| *name == shape.name)
            .map(|(.., price)| UnitPrice {
                on_demand: *price,
                spot: None,
            })
            .ok_or_else(|| {
                OptimizerError::NotFound(format!("price for {} {}", provider, shape.name))
            })
    }
}

/// A shape together with its resolved price
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricedShape {
    pub shape: InstanceShape,
    pub price: UnitPrice,
}

/// Price snapshot the engine computes costs against
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceBook {
    pub provider: Provider,
    pub region: String,
    /// Priced shapes ordered by on-demand price, cheapest first
    pub shapes: Vec<PricedShape>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    pub source: PriceSource,
}

impl PriceBook {
    /// Book that prices everything with the static per-resource estimate
    pub fn fallback(provider: Provider, region: impl Into<String>) -> Self {
        Self {
            provider,
            region: region.into(),
            shapes: Vec::new(),
            hint: None,
            source: PriceSource::Fallback,
        }
    }

    /// Build a book from already-known prices
    pub fn from_prices(
        provider: Provider,
        region: impl Into<String>,
        mut shapes: Vec<PricedShape>,
        hint: Option<String>,
    ) -> Self {
        shapes.sort_by(|a, b| {
            a.price
                .on_demand
                .partial_cmp(&b.price.on_demand)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.shape.name.cmp(&b.shape.name))
        });
        Self {
            provider,
            region: region.into(),
            shapes,
            hint,
            source: PriceSource::Resolver,
        }
    }

    /// Resolve prices for the provider's catalog, or only the hinted shape.
    ///
    /// All lookups together are bounded by `timeout`. Any failure degrades
    /// the whole book to the fallback estimate and returns the cause alongside it.
    pub async fn resolve(
        resolver: &dyn PricingResolver,
        provider: Provider,
        region: &str,
        hint: Option<&str>,
        timeout: Duration,
    ) -> (PriceBook, Option<OptimizerError>) {
        let shapes: Vec<InstanceShape> = catalog(provider)
            .into_iter()
            .filter(|s| hint.map(|h| h == s.name).unwrap_or(true))
            .collect();

        if shapes.is_empty() {
            let err = OptimizerError::NotFound(format!(
                "instance shape {} for {}",
                hint.unwrap_or("<any>"),
                provider
            ));
            warn!(provider = %provider, error = %err, "No catalog shapes, using fallback pricing");
            return (PriceBook::fallback(provider, region), Some(err));
        }

        let lookups = async {
            let mut priced = Vec::with_capacity(shapes.len());
            for shape in shapes {
                match resolver.get_unit_price(provider, &shape, region).await {
                    Ok(price) => priced.push(PricedShape { shape, price }),
                    Err(e) => {
                        warn!(
                            provider = %provider,
                            shape = %shape.name,
                            error = %e,
                            "Price lookup failed, using fallback pricing"
                        );
                        return Err(e);
                    }
                }
            }
            Ok(priced)
        };
        let priced = match tokio::time::timeout(timeout, lookups).await {
            Ok(Ok(priced)) => priced,
            Ok(Err(e)) => return (PriceBook::fallback(provider, region), Some(e)),
            Err(_) => {
                warn!(provider = %provider, "Price lookups timed out, using fallback pricing");
                return (
                    PriceBook::fallback(provider, region),
                    Some(OptimizerError::timeout("pricing resolver")),
                );
            }
        };

        debug!(provider = %provider, shapes = priced.len(), "Resolved price book");
        (
            PriceBook::from_prices(provider, region, priced, hint.map(str::to_string)),
            None,
        )
    }

    pub fn is_fallback(&self) -> bool {
        self.source == PriceSource::Fallback || self.shapes.is_empty()
    }

    /// Look up a shape by name
    pub fn shape(&self, name: &str) -> Option<&PricedShape> {
        self.shapes.iter().find(|s| s.shape.name == name)
    }

    /// Smallest shape covering the demand; the largest one when none does
    pub fn covering_shape(&self, cpu_cores: f64, memory_gb: f64) -> Option<&PricedShape> {
        if let Some(hinted) = self.hint.as_deref().and_then(|h| self.shape(h)) {
            return Some(hinted);
        }
        self.shapes
            .iter()
            .find(|s| s.shape.cpu_cores >= cpu_cores && s.shape.memory_gb >= memory_gb)
            .or_else(|| {
                self.shapes.iter().max_by(|a, b| {
                    (a.shape.cpu_cores, a.shape.memory_gb)
                        .partial_cmp(&(b.shape.cpu_cores, b.shape.memory_gb))
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
            })
    }
}

/// Static estimate used when no resolved price is available
pub fn fallback_hourly(cpu_cores: f64, memory_gb: f64) -> f64 {
    cpu_cores * FALLBACK_CPU_CORE_HOURLY + memory_gb * FALLBACK_MEMORY_GB_HOURLY
}
