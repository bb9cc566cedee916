//! Minimal unit registry for column and parameter units.
//!
//! Units are parsed into a scale factor relative to SI base units plus a dimension
//! vector over the seven SI base dimensions. That is enough to validate column labels
//! such as `"Voltage (mV)"`, to coerce incoming strings like `"5 kV"` into a declared
//! unit, and to reject dimensionally incompatible values.
//!
//! Supported syntax: a product of factors separated by `*`, `/` or `·`, where every
//! factor is a (prefixed) symbol or name with an optional integer exponent written as
//! `^n` or `**n`. Examples: `V`, `mV/s`, `m/s^2`, `kg*m**2`, `millivolt`, `ohm`, `Ω`.

use crate::error::{AppResult, DaqError};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::fmt;

/// Exponents over the SI base dimensions, in the order
/// length, mass, time, current, temperature, amount, luminosity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Dimension([i8; 7]);

impl Dimension {
    /// The dimension of a pure number.
    pub const NONE: Dimension = Dimension([0; 7]);

    const fn new(l: i8, m: i8, t: i8, i: i8, th: i8, n: i8, j: i8) -> Self {
        Dimension([l, m, t, i, th, n, j])
    }

    /// `self * other^power`, or `None` when an exponent leaves the `i8` range.
    fn combine(self, other: Dimension, power: i8) -> Option<Dimension> {
        let mut out = self.0;
        for (slot, exp) in out.iter_mut().zip(other.0) {
            *slot = exp.checked_mul(power).and_then(|e| slot.checked_add(e))?;
        }
        Some(Dimension(out))
    }

    /// True for a pure number.
    pub fn is_dimensionless(&self) -> bool {
        *self == Dimension::NONE
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [&str; 7] = ["[length]", "[mass]", "[time]", "[current]", "[temperature]", "[substance]", "[luminosity]"];
        if self.is_dimensionless() {
            return write!(f, "dimensionless");
        }
        let parts: Vec<String> = NAMES
            .iter()
            .zip(self.0)
            .filter(|(_, exp)| *exp != 0)
            .map(|(name, exp)| if exp == 1 { name.to_string() } else { format!("{name}^{exp}") })
            .collect();
        write!(f, "{}", parts.join(" * "))
    }
}

#[derive(Debug, Clone, Copy)]
struct BaseUnit {
    scale: f64,
    dim: Dimension,
    prefixable: bool,
}

const fn base(scale: f64, dim: Dimension) -> BaseUnit {
    BaseUnit {
        scale,
        dim,
        prefixable: true,
    }
}

const fn fixed(scale: f64, dim: Dimension) -> BaseUnit {
    BaseUnit {
        scale,
        dim,
        prefixable: false,
    }
}

const LENGTH: Dimension = Dimension::new(1, 0, 0, 0, 0, 0, 0);
const MASS: Dimension = Dimension::new(0, 1, 0, 0, 0, 0, 0);
const TIME: Dimension = Dimension::new(0, 0, 1, 0, 0, 0, 0);
const CURRENT: Dimension = Dimension::new(0, 0, 0, 1, 0, 0, 0);
const TEMPERATURE: Dimension = Dimension::new(0, 0, 0, 0, 1, 0, 0);
const AMOUNT: Dimension = Dimension::new(0, 0, 0, 0, 0, 1, 0);
const LUMINOSITY: Dimension = Dimension::new(0, 0, 0, 0, 0, 0, 1);
const FREQUENCY: Dimension = Dimension::new(0, 0, -1, 0, 0, 0, 0);
const FORCE: Dimension = Dimension::new(1, 1, -2, 0, 0, 0, 0);
const PRESSURE: Dimension = Dimension::new(-1, 1, -2, 0, 0, 0, 0);
const ENERGY: Dimension = Dimension::new(2, 1, -2, 0, 0, 0, 0);
const POWER: Dimension = Dimension::new(2, 1, -3, 0, 0, 0, 0);
const CHARGE: Dimension = Dimension::new(0, 0, 1, 1, 0, 0, 0);
const VOLTAGE: Dimension = Dimension::new(2, 1, -3, -1, 0, 0, 0);
const CAPACITANCE: Dimension = Dimension::new(-2, -1, 4, 2, 0, 0, 0);
const RESISTANCE: Dimension = Dimension::new(2, 1, -3, -2, 0, 0, 0);
const CONDUCTANCE: Dimension = Dimension::new(-2, -1, 3, 2, 0, 0, 0);
const FLUX: Dimension = Dimension::new(2, 1, -2, -1, 0, 0, 0);
const FLUX_DENSITY: Dimension = Dimension::new(0, 1, -2, -1, 0, 0, 0);
const INDUCTANCE: Dimension = Dimension::new(2, 1, -2, -2, 0, 0, 0);
const VOLUME: Dimension = Dimension::new(3, 0, 0, 0, 0, 0, 0);

static UNITS: Lazy<HashMap<&'static str, BaseUnit>> = Lazy::new(|| {
    let mut table = HashMap::new();
    let mut add = |names: &[&'static str], unit: BaseUnit| {
        for name in names {
            table.insert(*name, unit);
        }
    };
    add(&["m", "meter", "metre"], base(1.0, LENGTH));
    add(&["g", "gram"], base(1e-3, MASS));
    add(&["s", "sec", "second"], base(1.0, TIME));
    add(&["A", "amp", "ampere"], base(1.0, CURRENT));
    add(&["K", "kelvin"], base(1.0, TEMPERATURE));
    add(&["mol", "mole"], base(1.0, AMOUNT));
    add(&["cd", "candela"], base(1.0, LUMINOSITY));
    add(&["Hz", "hertz"], base(1.0, FREQUENCY));
    add(&["N", "newton"], base(1.0, FORCE));
    add(&["Pa", "pascal"], base(1.0, PRESSURE));
    add(&["J", "joule"], base(1.0, ENERGY));
    add(&["eV", "electron_volt"], base(1.602_176_634e-19, ENERGY));
    add(&["W", "watt"], base(1.0, POWER));
    add(&["C", "coulomb"], base(1.0, CHARGE));
    add(&["V", "volt"], base(1.0, VOLTAGE));
    add(&["F", "farad"], base(1.0, CAPACITANCE));
    add(&["Ω", "ohm", "Ohm"], base(1.0, RESISTANCE));
    add(&["S", "siemens"], base(1.0, CONDUCTANCE));
    add(&["Wb", "weber"], base(1.0, FLUX));
    add(&["T", "tesla"], base(1.0, FLUX_DENSITY));
    add(&["H", "henry"], base(1.0, INDUCTANCE));
    add(&["L", "l", "liter", "litre"], base(1e-3, VOLUME));
    add(&["min", "minute"], fixed(60.0, TIME));
    add(&["h", "hr", "hour"], fixed(3600.0, TIME));
    add(&["rad", "radian"], base(1.0, Dimension::NONE));
    add(&["deg", "degree", "°"], fixed(std::f64::consts::PI / 180.0, Dimension::NONE));
    add(&["%", "percent"], fixed(0.01, Dimension::NONE));
    add(&["dimensionless", "count"], fixed(1.0, Dimension::NONE));
    table
});

const PREFIXES: &[(&str, f64)] = &[
    ("Y", 1e24),
    ("Z", 1e21),
    ("E", 1e18),
    ("P", 1e15),
    ("T", 1e12),
    ("G", 1e9),
    ("M", 1e6),
    ("k", 1e3),
    ("h", 1e2),
    ("da", 1e1),
    ("d", 1e-1),
    ("c", 1e-2),
    ("m", 1e-3),
    ("u", 1e-6),
    ("µ", 1e-6),
    ("μ", 1e-6),
    ("n", 1e-9),
    ("p", 1e-12),
    ("f", 1e-15),
    ("a", 1e-18),
    ("z", 1e-21),
    ("y", 1e-24),
];

const PREFIX_NAMES: &[(&str, f64)] = &[
    ("yotta", 1e24),
    ("zetta", 1e21),
    ("exa", 1e18),
    ("peta", 1e15),
    ("tera", 1e12),
    ("giga", 1e9),
    ("mega", 1e6),
    ("kilo", 1e3),
    ("hecto", 1e2),
    ("deca", 1e1),
    ("deci", 1e-1),
    ("centi", 1e-2),
    ("milli", 1e-3),
    ("micro", 1e-6),
    ("nano", 1e-9),
    ("pico", 1e-12),
    ("femto", 1e-15),
    ("atto", 1e-18),
];

static FACTOR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([^\^\*]+?)(?:(?:\^|\*\*)([-+]?\d+))?$").expect("valid regex")
});

static QUANTITY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*([-+]?(?:(?:\d+\.?\d*|\.\d+)(?:[eE][-+]?\d+)?|nan|NaN|inf|Inf))\s*(.*?)\s*$")
        .expect("valid regex")
});

fn lookup(symbol: &str) -> Option<(f64, Dimension)> {
    if let Some(unit) = UNITS.get(symbol) {
        return Some((unit.scale, unit.dim));
    }
    let prefixed = |table: &[(&str, f64)], symbol: &str| {
        table.iter().find_map(|(prefix, factor)| {
            let rest = symbol.strip_prefix(*prefix)?;
            let unit = UNITS.get(rest).filter(|u| u.prefixable)?;
            Some((factor * unit.scale, unit.dim))
        })
    };
    // "da" must be tried before "d", which the table order guarantees
    prefixed(PREFIXES, symbol)
        .or_else(|| prefixed(PREFIX_NAMES, symbol))
        .or_else(|| {
            // plural names: "volts", "millivolts"
            let singular = symbol.strip_suffix('s')?;
            if singular.len() > 2 {
                lookup(singular)
            } else {
                None
            }
        })
}

/// A parsed unit expression.
#[derive(Debug, Clone)]
pub struct Unit {
    text: String,
    scale: f64,
    dim: Dimension,
}

impl Unit {
    /// The unit of a pure number.
    pub fn dimensionless() -> Self {
        Unit {
            text: String::new(),
            scale: 1.0,
            dim: Dimension::NONE,
        }
    }

    /// Parses a unit expression such as `"mV"`, `"m/s^2"` or `"ohm"`.
    pub fn parse(text: &str) -> AppResult<Self> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Ok(Unit::dimensionless());
        }

        let mut scale = 1.0;
        let mut dim = Dimension::NONE;
        let mut sign: i8 = 1;
        let mut factor = String::new();
        let normalized = trimmed.replace("**", "^");

        let mut flush = |factor: &mut String, sign: i8| -> AppResult<()> {
            let token = factor.trim();
            if token.is_empty() {
                return Err(DaqError::InvalidUnit(text.to_string()));
            }
            let caps = FACTOR
                .captures(token)
                .ok_or_else(|| DaqError::InvalidUnit(text.to_string()))?;
            let symbol = caps.get(1).map_or("", |m| m.as_str()).trim();
            let power: i8 = match caps.get(2) {
                Some(exp) => exp
                    .as_str()
                    .parse()
                    .map_err(|_| DaqError::InvalidUnit(text.to_string()))?,
                None => 1,
            };
            let (unit_scale, unit_dim) =
                lookup(symbol).ok_or_else(|| DaqError::InvalidUnit(text.to_string()))?;
            let power = power
                .checked_mul(sign)
                .ok_or_else(|| DaqError::InvalidUnit(text.to_string()))?;
            dim = dim
                .combine(unit_dim, power)
                .ok_or_else(|| DaqError::InvalidUnit(text.to_string()))?;
            scale *= unit_scale.powi(i32::from(power));
            factor.clear();
            Ok(())
        };

        for ch in normalized.chars() {
            match ch {
                '*' | '·' => {
                    flush(&mut factor, sign)?;
                    sign = 1;
                }
                '/' => {
                    flush(&mut factor, sign)?;
                    sign = -1;
                }
                _ => factor.push(ch),
            }
        }
        flush(&mut factor, sign)?;

        Ok(Unit {
            text: trimmed.to_string(),
            scale,
            dim,
        })
    }

    /// Unit text as it was declared.
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Dimension vector of this unit.
    pub fn dimension(&self) -> Dimension {
        self.dim
    }

    /// True when values in `self` can be converted into `other`.
    pub fn is_compatible(&self, other: &Unit) -> bool {
        self.dim == other.dim
    }

    /// True for a pure number.
    pub fn is_dimensionless(&self) -> bool {
        self.dim.is_dimensionless()
    }
}

impl PartialEq for Unit {
    fn eq(&self, other: &Self) -> bool {
        self.dim == other.dim && (self.scale - other.scale).abs() <= f64::EPSILON * self.scale.abs()
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// A magnitude paired with a unit.
#[derive(Debug, Clone, PartialEq)]
pub struct Quantity {
    /// Numeric value expressed in `unit`.
    pub magnitude: f64,
    /// Unit of the magnitude.
    pub unit: Unit,
}

impl Quantity {
    /// Creates a quantity from a magnitude and a unit expression.
    pub fn new(magnitude: f64, unit: &str) -> AppResult<Self> {
        Ok(Quantity {
            magnitude,
            unit: Unit::parse(unit)?,
        })
    }

    /// Parses strings like `"5 kV"`, `"-1.5e-3 A"` or `"12"`.
    pub fn parse(text: &str) -> AppResult<Self> {
        let caps = QUANTITY
            .captures(text)
            .ok_or_else(|| DaqError::InvalidUnit(text.to_string()))?;
        let magnitude: f64 = caps
            .get(1)
            .map_or("", |m| m.as_str())
            .to_ascii_lowercase()
            .parse()
            .map_err(|_| DaqError::InvalidUnit(text.to_string()))?;
        let unit = Unit::parse(caps.get(2).map_or("", |m| m.as_str()))?;
        Ok(Quantity { magnitude, unit })
    }

    /// Converts into `target`, failing when the dimensions differ.
    pub fn to(&self, target: &Unit) -> AppResult<Quantity> {
        if !self.unit.is_compatible(target) {
            return Err(DaqError::IncompatibleUnits {
                from: self.unit.to_string(),
                to: target.to_string(),
            });
        }
        let ratio = self.unit.scale / target.scale;
        Ok(Quantity {
            magnitude: self.magnitude * ratio,
            unit: target.clone(),
        })
    }

    /// Magnitude after conversion into `target`.
    pub fn magnitude_in(&self, target: &Unit) -> AppResult<f64> {
        self.to(target).map(|q| q.magnitude)
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let magnitude = crate::value::format_float(self.magnitude);
        if self.unit.as_str().is_empty() {
            f.write_str(&magnitude)
        } else {
            write!(f, "{} {}", magnitude, self.unit)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixed_symbols_scale() {
        let kv = Quantity::parse("5 kV").unwrap();
        let volts = Unit::parse("V").unwrap();
        assert_eq!(kv.magnitude_in(&volts).unwrap(), 5000.0);

        let mv = Quantity::parse("250 mV").unwrap();
        assert!((mv.magnitude_in(&volts).unwrap() - 0.25).abs() < 1e-12);
    }

    #[test]
    fn names_and_symbols_agree() {
        assert_eq!(Unit::parse("ohm").unwrap(), Unit::parse("Ω").unwrap());
        assert_eq!(Unit::parse("millivolt").unwrap(), Unit::parse("mV").unwrap());
        assert_eq!(Unit::parse("volts").unwrap(), Unit::parse("V").unwrap());
        assert_eq!(Unit::parse("kg").unwrap().dimension(), MASS);
    }

    #[test]
    fn exact_symbols_win_over_prefixes() {
        // "m" is metre, not milli-nothing; "min" is minute, "Pa" is pascal
        assert_eq!(Unit::parse("m").unwrap().dimension(), LENGTH);
        assert_eq!(Unit::parse("min").unwrap().scale, 60.0);
        assert_eq!(Unit::parse("Pa").unwrap().dimension(), PRESSURE);
        assert_eq!(Unit::parse("mm").unwrap().scale, 1e-3);
    }

    #[test]
    fn compound_expressions() {
        let accel = Unit::parse("m/s^2").unwrap();
        assert_eq!(accel.dimension(), Dimension::new(1, 0, -2, 0, 0, 0, 0));
        assert_eq!(Unit::parse("m*s**-2").unwrap(), accel);

        let rate = Quantity::parse("3 V/ms").unwrap();
        let per_second = Unit::parse("V/s").unwrap();
        assert!((rate.magnitude_in(&per_second).unwrap() - 3000.0).abs() < 1e-9);
        assert!(Unit::parse("W").unwrap().is_compatible(&Unit::parse("V*A").unwrap()));
    }

    #[test]
    fn incompatible_dimensions_fail() {
        let amps = Quantity::parse("2 A").unwrap();
        let err = amps.to(&Unit::parse("V").unwrap()).unwrap_err();
        assert!(matches!(err, DaqError::IncompatibleUnits { .. }));

        let bare = Quantity::parse("5").unwrap();
        assert!(bare.unit.is_dimensionless());
        assert!(bare.to(&Unit::parse("V").unwrap()).is_err());
    }

    #[test]
    fn unknown_units_are_rejected() {
        assert!(Unit::parse("furlong").is_err());
        assert!(Unit::parse("V//s").is_err());
        assert!(Quantity::parse("five volts").is_err());
        assert!(Unit::parse("").unwrap().is_dimensionless());
    }

    #[test]
    fn exponent_overflow_is_an_invalid_unit() {
        assert!(matches!(Unit::parse("V^50"), Err(DaqError::InvalidUnit(_))));
        assert!(matches!(Unit::parse("s/m^-128"), Err(DaqError::InvalidUnit(_))));
        assert!(matches!(Unit::parse("m^127*m"), Err(DaqError::InvalidUnit(_))));
        assert!(matches!(Quantity::parse("1 V^50"), Err(DaqError::InvalidUnit(_))));
        assert_eq!(Unit::parse("m^-128").unwrap().dimension(), Dimension::new(-128, 0, 0, 0, 0, 0, 0));
    }

    #[test]
    fn quantity_display_keeps_unit_text() {
        let q = Quantity::new(5.0, "kV").unwrap();
        assert_eq!(q.to_string(), "5.0 kV");
    }
}
