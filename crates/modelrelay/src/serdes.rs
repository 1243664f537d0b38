use std::time::Duration;

pub fn is_default<T: Default + PartialEq>(t: &T) -> bool {
	*t == T::default()
}

/// Serialize/deserialize a Duration as a humane string ("30s", "1h", "250ms").
pub mod serde_dur {
	use std::time::Duration;

	use serde::{Deserialize, Deserializer, Serializer, de};

	pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
		s.serialize_str(&super::format_dur(*d))
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
		let raw = String::deserialize(d)?;
		super::parse_dur(&raw).map_err(de::Error::custom)
	}
}

pub mod serde_dur_option {
	use std::time::Duration;

	use serde::{Deserialize, Deserializer, Serializer, de};

	pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
		match d {
			Some(d) => s.serialize_some(&super::format_dur(*d)),
			None => s.serialize_none(),
		}
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
		let raw = Option::<String>::deserialize(d)?;
		raw
			.map(|r| super::parse_dur(&r).map_err(de::Error::custom))
			.transpose()
	}
}

pub fn format_dur(d: Duration) -> String {
	if d.as_millis() % 1000 != 0 {
		format!("{}ms", d.as_millis())
	} else if d.as_secs() % 60 != 0 {
		format!("{}s", d.as_secs())
	} else if d.as_secs() % 3600 != 0 {
		format!("{}m", d.as_secs() / 60)
	} else {
		format!("{}h", d.as_secs() / 3600)
	}
}

pub fn parse_dur(raw: &str) -> Result<Duration, String> {
	let raw = raw.trim();
	let split = raw
		.find(|c: char| !c.is_ascii_digit() && c != '.')
		.ok_or_else(|| format!("duration {raw:?} is missing a unit"))?;
	let (num, unit) = raw.split_at(split);
	let num: f64 = num.parse().map_err(|_| format!("invalid duration {raw:?}"))?;
	let secs = match unit {
		"ms" => num / 1000.0,
		"s" => num,
		"m" => num * 60.0,
		"h" => num * 3600.0,
		_ => return Err(format!("unknown duration unit {unit:?}")),
	};
	Ok(Duration::from_secs_f64(secs))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn durations_round_trip() {
		for (raw, want) in [
			("30s", Duration::from_secs(30)),
			("250ms", Duration::from_millis(250)),
			("5m", Duration::from_secs(300)),
			("1h", Duration::from_secs(3600)),
			("1.5s", Duration::from_millis(1500)),
		] {
			let parsed = parse_dur(raw).unwrap();
			assert_eq!(parsed, want, "{raw}");
			assert_eq!(parse_dur(&format_dur(parsed)).unwrap(), want);
		}
		assert!(parse_dur("30").is_err());
		assert!(parse_dur("s").is_err());
	}
}
