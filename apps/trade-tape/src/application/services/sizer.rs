//! Adaptive Window Sizer
//!
//! Tracks the window coefficient: how many base pages of id-space the next
//! REST request should cover. The coefficient is a running estimate of the
//! inverse trade density of the id range being backfilled. It shrinks when
//! a venue returns more than the requested range could hold and grows in
//! proportion to how far a response falls short of a full page.
//!
//! The step sizes are empirical. They live in [`SizerConfig`] so deployments
//! can tune them per venue.

/// Growth applied when the fill ratio of a response is below `below`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GrowthTier {
    /// Exclusive upper bound on the fill ratio for this tier.
    pub below: f64,
    /// Amount added to the coefficient.
    pub step: f64,
}

/// Tunable constants of the control loop.
#[derive(Debug, Clone, PartialEq)]
pub struct SizerConfig {
    /// Ids per unit coefficient. `None` uses the venue's page size.
    pub base_page_size: Option<usize>,
    /// Above this coefficient a shrink halves instead of subtracting.
    pub halving_threshold: f64,
    /// Amount subtracted by a shrink at or below the halving threshold.
    pub shrink_step: f64,
    /// Growth tiers, ordered by ascending `below`.
    pub growth_tiers: Vec<GrowthTier>,
    /// Boost applied after an empty window below the realtime feed.
    pub gap_boost: f64,
    /// Fill ratio under which a batch counts as "small" for catch-up.
    pub catch_up_ratio: f64,
    /// Upper bound of the coefficient.
    pub max_coefficient: f64,
}

impl Default for SizerConfig {
    fn default() -> Self {
        Self {
            base_page_size: None,
            halving_threshold: 8.0,
            shrink_step: 1.0,
            growth_tiers: default_growth_tiers(),
            gap_boost: 50.0,
            catch_up_ratio: 0.5,
            max_coefficient: 10_000.0,
        }
    }
}

/// Six tiers from +6 for a nearly empty page down to +0.1 for a nearly
/// full one.
#[must_use]
pub fn default_growth_tiers() -> Vec<GrowthTier> {
    [
        (0.05, 6.0),
        (0.1, 4.0),
        (0.25, 2.0),
        (0.5, 1.0),
        (0.75, 0.5),
        (0.9, 0.1),
    ]
    .into_iter()
    .map(|(below, step)| GrowthTier { below, step })
    .collect()
}

/// The window coefficient and the rules that move it.
#[derive(Debug, Clone)]
pub struct AdaptiveSizer {
    config: SizerConfig,
    base_page_size: usize,
    coefficient: f64,
}

impl AdaptiveSizer {
    /// Create a sizer for a venue whose responses carry `venue_page_size`
    /// trades at most.
    #[must_use]
    pub fn new(config: SizerConfig, venue_page_size: usize) -> Self {
        let base_page_size = config.base_page_size.unwrap_or(venue_page_size).max(1);
        Self {
            config,
            base_page_size,
            coefficient: 1.0,
        }
    }

    /// Resume from a previously published coefficient.
    #[must_use]
    pub fn with_coefficient(mut self, coefficient: f64) -> Self {
        self.coefficient = self.clamp(coefficient);
        self
    }

    /// Current coefficient.
    #[must_use]
    pub const fn coefficient(&self) -> f64 {
        self.coefficient
    }

    /// Ids per unit coefficient.
    #[must_use]
    pub const fn base_page_size(&self) -> usize {
        self.base_page_size
    }

    /// Width in ids of the next request.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn window(&self) -> i64 {
        let width = (self.base_page_size as f64 * self.coefficient).round();
        (width as i64).max(1)
    }

    /// Trades a complete response to the next request would carry.
    #[must_use]
    pub fn expected(&self, venue_page_size: usize) -> usize {
        usize::try_from(self.window())
            .unwrap_or(usize::MAX)
            .min(venue_page_size.max(1))
    }

    /// Whether `retrieved` trades exceed what the window can hold.
    #[must_use]
    pub fn is_overshoot(&self, retrieved: usize) -> bool {
        i64::try_from(retrieved).map_or(true, |count| count > self.window())
    }

    /// Whether a response of `retrieved` trades is small enough to treat
    /// backfill as caught up.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn is_small(&self, retrieved: usize, expected: usize) -> bool {
        (retrieved as f64) < expected as f64 * self.config.catch_up_ratio
    }

    /// Narrow the window after an overshoot.
    ///
    /// Returns `false` when the coefficient is already at its floor.
    pub fn shrink(&mut self) -> bool {
        if self.coefficient <= 1.0 {
            return false;
        }
        let next = if self.coefficient > self.config.halving_threshold {
            self.coefficient / 2.0
        } else {
            self.coefficient - self.config.shrink_step
        };
        self.coefficient = self.clamp(next);
        true
    }

    /// Widen the window after a response of `retrieved` out of `expected`
    /// trades. Returns the step applied.
    #[allow(clippy::cast_precision_loss)]
    pub fn grow(&mut self, retrieved: usize, expected: usize) -> f64 {
        let fill = retrieved as f64 / expected.max(1) as f64;
        let step = self
            .config
            .growth_tiers
            .iter()
            .find(|tier| fill < tier.below)
            .map_or(0.0, |tier| tier.step);
        self.coefficient = self.clamp(self.coefficient + step);
        step
    }

    /// Jump ahead after an empty window below the realtime feed.
    pub fn boost(&mut self) {
        self.coefficient = self.clamp(self.coefficient + self.config.gap_boost);
    }

    fn clamp(&self, coefficient: f64) -> f64 {
        if coefficient.is_nan() {
            return 1.0;
        }
        coefficient.clamp(1.0, self.config.max_coefficient.max(1.0))
    }
}
