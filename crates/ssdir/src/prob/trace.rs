//! Recording of random choices.

use std::collections::HashMap;

use candle_core::Tensor;

use super::Distribution;

/// A named random choice recorded in a [`Trace`].
#[derive(Debug, Clone)]
pub struct Site {
    name: &'static str,
    dist: Distribution,
    value: Tensor,
    observed: bool,
    scale: f64,
}

impl Site {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn dist(&self) -> &Distribution {
        &self.dist
    }

    pub fn value(&self) -> &Tensor {
        &self.value
    }

    /// Whether the value was observed data rather than a sample.
    pub fn is_observed(&self) -> bool {
        self.observed
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// Computes the scaled log density of the site's value, one entry per batch element.
    pub fn log_prob(&self) -> candle_core::Result<Tensor> {
        self.dist.log_prob_sum(&self.value)? * self.scale
    }
}

/// Collects the random choices of one execution of a model or guide.
///
/// A trace created with [`Trace::replaying`] does not sample sites recorded in the replayed
/// trace, but reuses their values.
#[derive(Debug, Default)]
pub struct Trace {
    sites: Vec<Site>,
    replay: HashMap<&'static str, Tensor>,
    modules: Vec<&'static str>,
    scale: Option<f64>,
}

impl Trace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a trace that reuses the sampled (not observed) values of `other`.
    pub fn replaying(other: &Trace) -> Self {
        let replay = other
            .sites
            .iter()
            .filter(|site| !site.observed)
            .map(|site| (site.name, site.value.clone()))
            .collect();
        Self {
            replay,
            ..Self::default()
        }
    }

    /// Sets the factor applied to the log densities of all sites recorded from now on.
    pub fn set_scale(&mut self, scale: f64) {
        self.scale = Some(scale);
    }

    /// Records that the parameters of the module `name` take part in this execution.
    pub fn register_module(&mut self, name: &'static str) {
        if !self.modules.contains(&name) {
            self.modules.push(name);
        }
    }

    pub fn modules(&self) -> &[&'static str] {
        &self.modules
    }

    /// Samples a value from `dist` and records it as site `name`.
    ///
    /// If the trace is replaying a site of that name, the replayed value is used instead. Its
    /// shape must match the distribution's.
    pub fn sample(&mut self, name: &'static str, dist: Distribution) -> anyhow::Result<Tensor> {
        let value = match self.replay.get(name) {
            Some(value) => {
                if value.shape() != dist.shape() {
                    anyhow::bail!(
                        "replayed value of site `{name}` has shape {:?}, but distribution has {:?}",
                        value.dims(),
                        dist.shape().dims()
                    );
                }
                value.clone()
            }
            None => dist.sample()?,
        };
        self.record(name, dist, value.clone(), false)?;
        Ok(value)
    }

    /// Records the observed `value` of site `name`.
    pub fn observe(
        &mut self,
        name: &'static str,
        dist: Distribution,
        value: &Tensor,
    ) -> anyhow::Result<()> {
        if value.shape() != dist.shape() {
            anyhow::bail!(
                "observed value of site `{name}` has shape {:?}, but distribution has {:?}",
                value.dims(),
                dist.shape().dims()
            );
        }
        self.record(name, dist, value.clone(), true)
    }

    fn record(
        &mut self,
        name: &'static str,
        dist: Distribution,
        value: Tensor,
        observed: bool,
    ) -> anyhow::Result<()> {
        if self.site(name).is_some() {
            anyhow::bail!("site `{name}` was recorded twice");
        }
        log::trace!("site `{name}`: {:?}", value.dims());
        self.sites.push(Site {
            name,
            dist,
            value,
            observed,
            scale: self.scale.unwrap_or(1.0),
        });
        Ok(())
    }

    pub fn site(&self, name: &str) -> Option<&Site> {
        self.sites.iter().find(|site| site.name == name)
    }

    pub fn sites(&self) -> &[Site] {
        &self.sites
    }

    /// Sums the scaled log densities of all sites per batch element.
    pub fn log_prob(&self) -> anyhow::Result<Tensor> {
        self.log_prob_of(|_| true)
    }

    /// Sums the scaled log densities of the sites selected by `filter` per batch element.
    pub fn log_prob_of(&self, filter: impl Fn(&Site) -> bool) -> anyhow::Result<Tensor> {
        let mut total: Option<Tensor> = None;
        for site in self.sites.iter().filter(|site| filter(site)) {
            let lp = site.log_prob()?;
            total = Some(match total {
                Some(total) => (total + lp)?,
                None => lp,
            });
        }
        total.ok_or_else(|| anyhow::anyhow!("no sites to compute the log density of"))
    }
}
