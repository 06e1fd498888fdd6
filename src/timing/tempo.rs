//! Tempo map: the conversion layer between Real time (milliseconds) and
//! Metered time (ticks), built from a chronological list of tempo
//! segments. A segment either switches tempo instantaneously or ramps it
//! exponentially (accelerando/decelerando). Within a ramp, metered time
//! advances linearly with ramp progress while real time is its time
//! integral, which is why the two duration-derivation formulas below are
//! not mirror images of each other.

use serde::{Deserialize, Serialize};

use super::{ClockDomain, TICKS_PER_QUARTER};

/// Ratios this close to 1.0 are treated as "no tempo change" so the ramp
/// math never divides by a vanishing `ln`.
const FLAT_RATIO_TOLERANCE: f64 = 1e-9;

/// Milliseconds per tick at a given tempo period (microseconds per
/// quarter note).
fn ms_per_tick(period: f64) -> f64 {
    period / (TICKS_PER_QUARTER as f64 * 1000.0)
}

/// A tempo change request, as carried by the document layer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TempoChange {
    /// Start of the change, in `domain` units.
    pub at: f64,
    /// Ramp length in `domain` units; zero for an instant change.
    pub duration: f64,
    /// Target tempo in beats per minute.
    pub bpm: f64,
    pub domain: ClockDomain,
}

/// One tempo segment. Origin/duration/end are held in both domains; the
/// fields are mutually derivable and kept consistent by construction.
#[derive(Debug, Clone, Copy)]
pub struct TempoMapEntry {
    pub real_origin: f64,
    pub metered_origin: f64,
    pub real_duration: f64,
    pub metered_duration: f64,
    /// Tempo period (µs per quarter) at the segment start.
    pub initial_period: f64,
    /// Tempo period at the segment end; equal to `initial_period` for a
    /// flat segment.
    pub final_period: f64,
    /// ln(final/initial), precomputed for ramp interpolation. Zero marks
    /// a flat or instantaneous segment.
    pub ln_ratio: f64,
}

impl TempoMapEntry {
    fn flat(real_origin: f64, metered_origin: f64, period: f64) -> Self {
        TempoMapEntry {
            real_origin,
            metered_origin,
            real_duration: 0.0,
            metered_duration: 0.0,
            initial_period: period,
            final_period: period,
            ln_ratio: 0.0,
        }
    }

    pub fn real_end(&self) -> f64 {
        self.real_origin + self.real_duration
    }

    pub fn metered_end(&self) -> f64 {
        self.metered_origin + self.metered_duration
    }

    fn is_ramp(&self) -> bool {
        self.ln_ratio != 0.0 && self.metered_duration > 0.0
    }

    /// Ramp progress in [0, 1] at `time`, clamped outside the segment.
    /// Linear in the Metered domain; logarithmic in Real, because real
    /// time accumulates faster as the period grows.
    fn fraction(&self, time: f64, domain: ClockDomain) -> f64 {
        let frac = match domain {
            ClockDomain::Metered => (time - self.metered_origin) / self.metered_duration,
            ClockDomain::Real => {
                let scaled = (time - self.real_origin) * self.ln_ratio
                    / (ms_per_tick(self.initial_period) * self.metered_duration);
                (1.0 + scaled).max(f64::MIN_POSITIVE).ln() / self.ln_ratio
            }
        };
        frac.clamp(0.0, 1.0)
    }

    /// Instantaneous tempo period at `time`: the initial period before
    /// the segment, the final period after it, exponential in between.
    pub fn interpolate_period(&self, time: f64, domain: ClockDomain) -> f64 {
        let origin = match domain {
            ClockDomain::Real => self.real_origin,
            ClockDomain::Metered => self.metered_origin,
        };
        if !self.is_ramp() {
            return if time < origin {
                self.initial_period
            } else {
                self.final_period
            };
        }
        if time <= origin {
            return self.initial_period;
        }
        let end = match domain {
            ClockDomain::Real => self.real_end(),
            ClockDomain::Metered => self.metered_end(),
        };
        if time >= end {
            return self.final_period;
        }
        self.initial_period * (self.ln_ratio * self.fraction(time, domain)).exp()
    }

    /// Convert an absolute Metered time to Real time. Exact inverse of
    /// [`real_to_metered`](Self::real_to_metered) to floating-point
    /// tolerance.
    pub fn metered_to_real(&self, ticks: f64) -> f64 {
        if ticks <= self.metered_origin {
            return self.real_origin - (self.metered_origin - ticks) * ms_per_tick(self.initial_period);
        }
        if !self.is_ramp() || ticks >= self.metered_end() {
            return self.real_end() + (ticks - self.metered_end()) * ms_per_tick(self.final_period);
        }
        let frac = (ticks - self.metered_origin) / self.metered_duration;
        let k0 = ms_per_tick(self.initial_period);
        self.real_origin
            + k0 * self.metered_duration / self.ln_ratio * ((self.ln_ratio * frac).exp() - 1.0)
    }

    /// Convert an absolute Real time to Metered time.
    pub fn real_to_metered(&self, ms: f64) -> f64 {
        if ms <= self.real_origin {
            return self.metered_origin - (self.real_origin - ms) / ms_per_tick(self.initial_period);
        }
        if !self.is_ramp() || ms >= self.real_end() {
            return self.metered_end() + (ms - self.real_end()) / ms_per_tick(self.final_period);
        }
        let frac = self.fraction(ms, ClockDomain::Real);
        self.metered_origin + frac * self.metered_duration
    }
}

/// Chronological, non-overlapping tempo segments, binary-searchable by
/// either domain's origin.
#[derive(Debug, Clone)]
pub struct TempoMap {
    entries: Vec<TempoMapEntry>,
}

impl Default for TempoMap {
    fn default() -> Self {
        // 120 BPM until the document says otherwise.
        TempoMap::new(500_000.0)
    }
}

impl TempoMap {
    pub fn new(initial_period: f64) -> Self {
        TempoMap {
            entries: vec![TempoMapEntry::flat(0.0, 0.0, initial_period)],
        }
    }

    /// Build a map from an initial tempo and a list of changes, which
    /// must already be in chronological order.
    pub fn from_changes(initial_bpm: f64, changes: &[TempoChange]) -> Self {
        let mut map = TempoMap::new(60_000_000.0 / initial_bpm);
        for change in changes {
            map.set_tempo(60_000_000.0 / change.bpm, change.at, change.duration, change.domain);
        }
        map
    }

    /// Append a tempo segment ramping from the current final tempo to
    /// `period`, starting at `start` and lasting `duration`, both given
    /// in `domain` units. The other domain's start and duration are
    /// derived. Equal tempos or a non-positive duration collapse both
    /// durations to zero (an instantaneous change); derived durations
    /// that round non-positive are clamped to zero the same way.
    pub fn set_tempo(&mut self, period: f64, start: f64, duration: f64, domain: ClockDomain) {
        let prev = *self.entries.last().unwrap_or(&TempoMapEntry::flat(0.0, 0.0, 500_000.0));
        let p0 = prev.final_period;

        // Resolve the segment origin in both domains, never earlier than
        // the previous segment's end (entries must stay chronological).
        let (real_origin, metered_origin) = match domain {
            ClockDomain::Real => {
                let r = start.max(prev.real_end());
                (r, prev.real_to_metered(r))
            }
            ClockDomain::Metered => {
                let m = start.max(prev.metered_end());
                (prev.metered_to_real(m), m)
            }
        };

        let ratio = period / p0;
        let flat = (ratio - 1.0).abs() < FLAT_RATIO_TOLERANCE || duration <= 0.0;

        let entry = if flat {
            TempoMapEntry {
                real_origin,
                metered_origin,
                real_duration: 0.0,
                metered_duration: 0.0,
                initial_period: p0,
                final_period: period,
                ln_ratio: 0.0,
            }
        } else {
            let ln_ratio = ratio.ln();
            let k0 = ms_per_tick(p0);
            // Real duration is the integral of the period over the ramp;
            // metered duration advances linearly, hence the asymmetric
            // closed forms.
            let (real_duration, metered_duration) = match domain {
                ClockDomain::Metered => {
                    let m = duration;
                    (k0 * m * (ratio - 1.0) / ln_ratio, m)
                }
                ClockDomain::Real => {
                    let d = duration;
                    (d, d * ln_ratio / (ms_per_tick(period) - k0))
                }
            };
            if real_duration <= 0.0 || metered_duration <= 0.0 {
                TempoMapEntry {
                    real_origin,
                    metered_origin,
                    real_duration: 0.0,
                    metered_duration: 0.0,
                    initial_period: p0,
                    final_period: period,
                    ln_ratio: 0.0,
                }
            } else {
                TempoMapEntry {
                    real_origin,
                    metered_origin,
                    real_duration,
                    metered_duration,
                    initial_period: p0,
                    final_period: period,
                    ln_ratio,
                }
            }
        };

        self.entries.push(entry);
    }

    /// Last entry whose origin in `domain` is at or before `time`.
    fn find(&self, time: f64, domain: ClockDomain) -> &TempoMapEntry {
        let idx = self.entries.partition_point(|e| {
            let origin = match domain {
                ClockDomain::Real => e.real_origin,
                ClockDomain::Metered => e.metered_origin,
            };
            origin <= time
        });
        // Before the first origin, the first entry extrapolates flat.
        &self.entries[idx.saturating_sub(1)]
    }

    pub fn interpolate_period(&self, time: f64, domain: ClockDomain) -> f64 {
        self.find(time, domain).interpolate_period(time, domain)
    }

    /// Current tempo in BPM at a Real time, for state queries.
    pub fn bpm_at_real(&self, ms: f64) -> f64 {
        60_000_000.0 / self.interpolate_period(ms, ClockDomain::Real)
    }

    pub fn metered_to_real(&self, ticks: f64) -> f64 {
        self.find(ticks, ClockDomain::Metered).metered_to_real(ticks)
    }

    pub fn real_to_metered(&self, ms: f64) -> f64 {
        self.find(ms, ClockDomain::Real).real_to_metered(ms)
    }

    /// Convert a time from `from` into the other domain.
    pub fn convert(&self, time: f64, from: ClockDomain) -> f64 {
        match from {
            ClockDomain::Real => self.real_to_metered(time),
            ClockDomain::Metered => self.metered_to_real(time),
        }
    }
}
