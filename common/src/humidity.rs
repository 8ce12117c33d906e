//! Absolute humidity from temperature and relative humidity (Magnus approximation).

use crate::error::DomainError;

pub const MIN_TEMPERATURE_C: f64 = -60.0;
pub const MAX_TEMPERATURE_C: f64 = 80.0;

const MAGNUS_A_HPA: f64 = 6.112;
const MAGNUS_B: f64 = 17.67;
const MAGNUS_C_C: f64 = 243.5;
const WATER_MOLAR_MASS: f64 = 18.016;
const GAS_CONSTANT: f64 = 8314.3;
const KELVIN_OFFSET: f64 = 273.15;

/// Saturation vapor pressure over water in hPa.
pub fn saturation_vapor_pressure(temperature_c: f64) -> f64 {
    MAGNUS_A_HPA * ((MAGNUS_B * temperature_c) / (MAGNUS_C_C + temperature_c)).exp()
}

/// Water vapor density in g/m³.
pub fn absolute_humidity(temperature_c: f64, relative_humidity_pct: f64) -> Result<f64, DomainError> {
    if !temperature_c.is_finite()
        || !(MIN_TEMPERATURE_C..=MAX_TEMPERATURE_C).contains(&temperature_c)
    {
        return Err(DomainError::TemperatureOutOfRange(temperature_c));
    }
    if !relative_humidity_pct.is_finite() || !(0.0..=100.0).contains(&relative_humidity_pct) {
        return Err(DomainError::HumidityOutOfRange(relative_humidity_pct));
    }

    let vapor_pressure = relative_humidity_pct / 100.0 * saturation_vapor_pressure(temperature_c);
    Ok(1e5 * WATER_MOLAR_MASS / GAS_CONSTANT * vapor_pressure / (temperature_c + KELVIN_OFFSET))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn matches_reference_values() {
        // 20 °C / 50 % holds roughly 8.6 g/m³.
        let ah = absolute_humidity(20.0, 50.0).unwrap();
        assert!((ah - 8.63).abs() < 0.05, "got {ah}");

        let ah = absolute_humidity(0.0, 100.0).unwrap();
        assert!((ah - 4.85).abs() < 0.05, "got {ah}");
    }

    #[test]
    fn dry_air_has_no_water() {
        assert_eq!(absolute_humidity(25.0, 0.0).unwrap(), 0.0);
    }

    #[test]
    fn rejects_implausible_inputs() {
        assert_eq!(
            absolute_humidity(20.0, 100.5),
            Err(DomainError::HumidityOutOfRange(100.5))
        );
        assert_eq!(
            absolute_humidity(20.0, -1.0),
            Err(DomainError::HumidityOutOfRange(-1.0))
        );
        assert_eq!(
            absolute_humidity(-61.0, 50.0),
            Err(DomainError::TemperatureOutOfRange(-61.0))
        );
        assert_eq!(
            absolute_humidity(80.5, 50.0),
            Err(DomainError::TemperatureOutOfRange(80.5))
        );
        assert!(absolute_humidity(f64::NAN, 50.0).is_err());
        assert!(absolute_humidity(20.0, f64::INFINITY).is_err());
    }

    proptest! {
        #[test]
        fn increases_with_relative_humidity(
            t in MIN_TEMPERATURE_C..=MAX_TEMPERATURE_C,
            rh in 0.0f64..99.0,
            step in 0.5f64..1.0,
        ) {
            let low = absolute_humidity(t, rh).unwrap();
            let high = absolute_humidity(t, rh + step).unwrap();
            prop_assert!(high > low);
        }

        #[test]
        fn increases_with_temperature(
            t in MIN_TEMPERATURE_C..79.0,
            rh in 1.0f64..=100.0,
            step in 0.5f64..1.0,
        ) {
            let low = absolute_humidity(t, rh).unwrap();
            let high = absolute_humidity(t + step, rh).unwrap();
            prop_assert!(high > low);
        }
    }
}
