//! Volume configuration.
//!
//! Options arrive as string key/value pairs at init. Unknown keys are
//! rejected; missing keys fall back to defaults. The derived [`EcGeometry`]
//! fixes the fragment and stripe sizes used by every striped operation.

use serde::{Deserialize, Serialize};

use crate::ondisk::{CONFIG_ALGORITHM, CONFIG_VERSION, ConfigRecord};

/// How the first brick of a read dispatch is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReadPolicy {
    #[default]
    RoundRobin,
    GfidHash,
}

impl ReadPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "round-robin" | "roundrobin" => Some(ReadPolicy::RoundRobin),
            "gfid-hash" | "gfidhash" => Some(ReadPolicy::GfidHash),
            _ => None,
        }
    }
}

/// Parsed init-time options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeOptions {
    pub nodes: u8,
    pub redundancy: u8,
    pub read_policy: ReadPolicy,
    pub eager_lock: bool,
    pub background_heals: u32,
    pub heal_wait_qlen: u32,
    pub stripe_cache: u32,
    pub self_heal_window_size: u32,
    pub shutdown_timeout_sec: u32,
    pub delayed_unlock_msec: u32,
    pub quota_deem_statfs: bool,
}

impl VolumeOptions {
    pub fn new(nodes: u8, redundancy: u8) -> Self {
        VolumeOptions {
            nodes,
            redundancy,
            read_policy: ReadPolicy::RoundRobin,
            eager_lock: true,
            background_heals: 8,
            heal_wait_qlen: 128,
            stripe_cache: 4,
            self_heal_window_size: 1,
            shutdown_timeout_sec: 10,
            delayed_unlock_msec: 1000,
            quota_deem_statfs: false,
        }
    }

    /// Parse from init-time key/value pairs. `nodes` and `redundancy` are
    /// mandatory; everything else defaults.
    pub fn from_pairs<'a, I>(pairs: I) -> Result<Self, OptionError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut nodes: Option<u8> = None;
        let mut redundancy: Option<u8> = None;
        let mut opts = VolumeOptions::new(0, 0);

        for (key, value) in pairs {
            match key {
                "nodes" => nodes = Some(parse_num(key, value)?),
                "redundancy" => redundancy = Some(parse_num(key, value)?),
                "read-policy" => {
                    opts.read_policy = ReadPolicy::parse(value)
                        .ok_or_else(|| OptionError::bad(key, value))?;
                }
                "eager-lock" => opts.eager_lock = parse_bool(key, value)?,
                "background-heals" => opts.background_heals = parse_num(key, value)?,
                "heal-wait-qlen" => opts.heal_wait_qlen = parse_num(key, value)?,
                "stripe-cache" => opts.stripe_cache = parse_num(key, value)?,
                "self-heal-window-size" => {
                    opts.self_heal_window_size = parse_num(key, value)?;
                }
                "shutdown-timeout-sec" => opts.shutdown_timeout_sec = parse_num(key, value)?,
                "delayed-unlock-msec" => opts.delayed_unlock_msec = parse_num(key, value)?,
                "quota-deem-statfs" => opts.quota_deem_statfs = parse_bool(key, value)?,
                _ => return Err(OptionError::unknown(key)),
            }
        }

        opts.nodes = nodes.ok_or(OptionError::missing("nodes"))?;
        opts.redundancy = redundancy.ok_or(OptionError::missing("redundancy"))?;
        opts.validate()?;
        Ok(opts)
    }

    pub fn validate(&self) -> Result<(), OptionError> {
        let n = u32::from(self.nodes);
        let m = u32::from(self.redundancy);
        if n == 0 || n > 64 {
            return Err(OptionError::bad("nodes", &self.nodes.to_string()));
        }
        if m == 0 || 2 * m >= n {
            return Err(OptionError::bad("redundancy", &self.redundancy.to_string()));
        }
        Ok(())
    }

    pub fn fragments(&self) -> usize {
        usize::from(self.nodes) - usize::from(self.redundancy)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum OptionError {
    #[error("missing mandatory option '{0}'")]
    Missing(String),
    #[error("unknown option '{0}'")]
    Unknown(String),
    #[error("invalid value '{value}' for option '{key}'")]
    Invalid { key: String, value: String },
}

impl OptionError {
    fn missing(key: &str) -> Self {
        OptionError::Missing(key.to_string())
    }
    fn unknown(key: &str) -> Self {
        OptionError::Unknown(key.to_string())
    }
    fn bad(key: &str, value: &str) -> Self {
        OptionError::Invalid {
            key: key.to_string(),
            value: value.to_string(),
        }
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, OptionError> {
    value.parse().map_err(|_| OptionError::bad(key, value))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, OptionError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "on" | "yes" | "1" | "enable" => Ok(true),
        "false" | "off" | "no" | "0" | "disable" => Ok(false),
        _ => Err(OptionError::bad(key, value)),
    }
}

// ---------------------------------------------------------------------------
// Derived geometry
// ---------------------------------------------------------------------------

/// Galois word size in bits used by the default codec.
pub const GF_WORD_BITS: u8 = 8;

/// Baseline fragment size; rounded up so the word-alignment invariant
/// holds for any K.
const BASE_FRAGMENT_SIZE: u32 = 4096;

/// Sizes derived from N and M: everything striped I/O aligns to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EcGeometry {
    pub nodes: usize,
    pub fragments: usize,
    pub redundancy: usize,
    pub fragment_size: u64,
    pub stripe_size: u64,
}

impl EcGeometry {
    pub fn new(nodes: u8, redundancy: u8) -> Self {
        let fragments = usize::from(nodes) - usize::from(redundancy);

        // chunk_size * 8 must be a multiple of word_size * K; the smallest
        // such multiple at or above the baseline keeps fragments page-like.
        let unit = u64::from(GF_WORD_BITS) * fragments as u64; // bits
        let base_bits = u64::from(BASE_FRAGMENT_SIZE) * 8;
        let bits = base_bits.div_ceil(unit) * unit;
        let fragment_size = bits / 8;

        EcGeometry {
            nodes: usize::from(nodes),
            fragments,
            redundancy: usize::from(redundancy),
            fragment_size,
            stripe_size: fragment_size * fragments as u64,
        }
    }

    /// The immutable config record seeded on every new regular file.
    pub fn config_record(&self) -> ConfigRecord {
        ConfigRecord {
            version: CONFIG_VERSION,
            algorithm: CONFIG_ALGORITHM,
            word_size: GF_WORD_BITS,
            bricks: self.nodes as u8,
            redundancy: self.redundancy as u8,
            chunk_size: self.fragment_size as u32,
        }
    }

    /// A stored config is acceptable iff it matches this volume exactly.
    pub fn config_matches(&self, rec: &ConfigRecord) -> bool {
        *rec == self.config_record()
    }

    /// Round `offset` down to a stripe boundary, returning the cut head.
    pub fn align_offset_down(&self, offset: u64) -> (u64, u64) {
        let head = offset % self.stripe_size;
        (offset - head, head)
    }

    /// Round `size` up to a whole number of stripes.
    pub fn align_size_up(&self, size: u64) -> u64 {
        size.div_ceil(self.stripe_size) * self.stripe_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let o = VolumeOptions::new(6, 2);
        assert!(o.eager_lock);
        assert_eq!(o.background_heals, 8);
        assert_eq!(o.heal_wait_qlen, 128);
        assert_eq!(o.stripe_cache, 4);
        assert_eq!(o.self_heal_window_size, 1);
        assert_eq!(o.shutdown_timeout_sec, 10);
        assert_eq!(o.delayed_unlock_msec, 1000);
        assert_eq!(o.read_policy, ReadPolicy::RoundRobin);
    }

    #[test]
    fn pairs_parsing() {
        let opts = VolumeOptions::from_pairs([
            ("nodes", "6"),
            ("redundancy", "2"),
            ("read-policy", "gfid-hash"),
            ("eager-lock", "off"),
            ("background-heals", "4"),
        ])
        .unwrap();
        assert_eq!(opts.nodes, 6);
        assert_eq!(opts.redundancy, 2);
        assert_eq!(opts.read_policy, ReadPolicy::GfidHash);
        assert!(!opts.eager_lock);
        assert_eq!(opts.background_heals, 4);
    }

    #[test]
    fn pairs_reject_bad_input() {
        assert_eq!(
            VolumeOptions::from_pairs([("redundancy", "2")]),
            Err(OptionError::missing("nodes"))
        );
        assert!(matches!(
            VolumeOptions::from_pairs([("nodes", "6"), ("redundancy", "2"), ("bogus", "1")]),
            Err(OptionError::Unknown(_))
        ));
        // 2M >= N is invalid.
        assert!(matches!(
            VolumeOptions::from_pairs([("nodes", "6"), ("redundancy", "3")]),
            Err(OptionError::Invalid { .. })
        ));
    }

    #[test]
    fn geometry_for_power_of_two_k() {
        let g = EcGeometry::new(6, 2);
        assert_eq!(g.fragments, 4);
        assert_eq!(g.fragment_size, 4096);
        assert_eq!(g.stripe_size, 16384);
        assert!(g.config_record().is_plausible());
    }

    #[test]
    fn geometry_for_awkward_k_keeps_invariant() {
        let g = EcGeometry::new(5, 2); // K = 3
        assert_eq!(g.fragments, 3);
        // chunk * 8 divisible by word * K.
        assert_eq!((g.fragment_size * 8) % (u64::from(GF_WORD_BITS) * 3), 0);
        assert!(g.fragment_size >= 4096);
        assert!(g.config_record().is_plausible());
    }

    #[test]
    fn alignment_helpers() {
        let g = EcGeometry::new(6, 2);
        let (aligned, head) = g.align_offset_down(16384 + 50);
        assert_eq!(aligned, 16384);
        assert_eq!(head, 50);
        assert_eq!(g.align_size_up(1), 16384);
        assert_eq!(g.align_size_up(16384), 16384);
        assert_eq!(g.align_size_up(16385), 32768);
    }

    #[test]
    fn config_record_roundtrip_matches() {
        let g = EcGeometry::new(6, 2);
        let rec = g.config_record();
        assert!(g.config_matches(&rec));
        let other = EcGeometry::new(5, 2);
        assert!(!other.config_matches(&rec));
    }
}
