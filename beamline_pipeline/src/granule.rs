//! Granule resource names.
//!
//! Altimetry granule names embed the orbit in a fixed block:
//! `..._RRRRCCGG_...` where `RRRR` is the reference ground track, `CC` the
//! cycle and `GG` the orbital region. Those three feed the extent id prefix.

use lazy_static::lazy_static;
use regex::Regex;

/// Orbit coordinates parsed from a granule resource name.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct GranuleName {
	pub rgt: u16,
	pub cycle: u8,
	pub region: u8,
}

impl GranuleName {
	/// Parses the orbit block out of a resource name or URL. Names without
	/// one yield all zeros; the pipeline still runs, only the extent id
	/// prefix is less telling.
	#[must_use]
	pub fn parse(resource: &str) -> GranuleName {
		lazy_static! {
			static ref RE_ORBIT: Regex = Regex::new(r"_(\d{4})(\d{2})(\d{2})_\d{3}_\d{2}\.").unwrap();
		}
		let Some(caps) = RE_ORBIT.captures(resource) else {
			return GranuleName::default();
		};
		GranuleName {
			rgt: caps[1].parse().unwrap_or(0),
			cycle: caps[2].parse().unwrap_or(0),
			region: caps[3].parse().unwrap_or(0),
		}
	}
}
