//! Fee calculation.
//!
//! Amounts are integer minor units (cents). Intermediate math runs on
//! [`Decimal`] and every fee is rounded once, half-up, to whole cents.
//!
//! # Rounding order
//!
//! When fees are passed to the payer the gross-up charge is computed exactly
//! and rounded once. The processor fee is then computed on that rounded
//! charge and rounded once. If rounding leaves the organization a cent short,
//! the charge is raised by one cent until the net covers the base amount.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use super::config::ProcessorFeeConfig;
use super::error::BillingError;
use super::types::{BillingFrequency, PaymentType, PlatformFeeSchedule};
use crate::error::{DuesError, Result};

/// Safety bound on the one-cent gross-up correction loop.
const MAX_GROSS_UP_STEPS: u32 = 100;

/// Result of a fee calculation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FeeBreakdown {
    /// The amount the organization wants to collect before fees.
    pub base_amount_cents: i64,
    pub processor_fee_cents: i64,
    pub platform_fee_cents: i64,
    pub total_fees_cents: i64,
    /// What the payer is charged.
    pub charge_amount_cents: i64,
    /// What the organization keeps.
    pub net_amount_cents: i64,
    pub fees_passed_to_member: bool,
}

/// Computes fee breakdowns for one processor fee configuration.
#[derive(Debug, Clone)]
pub struct FeeCalculator {
    processor: ProcessorFeeConfig,
}

impl FeeCalculator {
    /// Create a calculator.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the processor percentage is outside
    /// `[0, 1)` or the fixed fee is negative.
    pub fn new(processor: ProcessorFeeConfig) -> Result<Self> {
        processor.validate().map_err(DuesError::configuration)?;
        Ok(Self { processor })
    }

    #[must_use]
    pub fn processor_config(&self) -> &ProcessorFeeConfig {
        &self.processor
    }

    /// Processor fee for charging `amount_cents`.
    pub fn processor_fee(&self, amount_cents: i64) -> Result<i64> {
        let fee = Decimal::from(amount_cents) * self.processor.percent
            + Decimal::from(self.processor.fixed_cents);
        to_cents(fee, "processor_fee")
    }

    /// Compute the fee breakdown for `base_amount_cents`.
    ///
    /// `platform_fee` is in major currency units. A zero base amount (e.g. a
    /// waived enrollment fee) yields an all-zero breakdown.
    ///
    /// # Errors
    ///
    /// Returns a validation error for negative inputs.
    pub fn calculate(
        &self,
        base_amount_cents: i64,
        platform_fee: Decimal,
        pass_fees_to_member: bool,
    ) -> Result<FeeBreakdown> {
        if base_amount_cents < 0 {
            return Err(BillingError::InvalidAmount {
                field: "base_amount_cents".to_string(),
                reason: format!("must not be negative, got {}", base_amount_cents),
            }
            .into());
        }
        if platform_fee < Decimal::ZERO {
            return Err(BillingError::InvalidAmount {
                field: "platform_fee".to_string(),
                reason: format!("must not be negative, got {}", platform_fee),
            }
            .into());
        }

        if base_amount_cents == 0 {
            return Ok(FeeBreakdown {
                fees_passed_to_member: pass_fees_to_member,
                ..FeeBreakdown::default()
            });
        }

        let platform_fee_cents = to_cents(platform_fee * Decimal::ONE_HUNDRED, "platform_fee")?;

        if !pass_fees_to_member {
            let processor_fee_cents = self.processor_fee(base_amount_cents)?;
            let total_fees_cents = processor_fee_cents + platform_fee_cents;
            return Ok(FeeBreakdown {
                base_amount_cents,
                processor_fee_cents,
                platform_fee_cents,
                total_fees_cents,
                charge_amount_cents: base_amount_cents,
                net_amount_cents: base_amount_cents - total_fees_cents,
                fees_passed_to_member: false,
            });
        }

        // Solve X - (X * p + fixed) - F = B  =>  X = (B + F + fixed) / (1 - p)
        let numerator = Decimal::from(base_amount_cents)
            + Decimal::from(platform_fee_cents)
            + Decimal::from(self.processor.fixed_cents);
        let mut charge = to_cents(numerator / (Decimal::ONE - self.processor.percent), "charge")?;

        let mut processor_fee_cents = self.processor_fee(charge)?;
        let mut steps = 0;
        while charge - processor_fee_cents - platform_fee_cents < base_amount_cents {
            if steps >= MAX_GROSS_UP_STEPS {
                return Err(DuesError::internal(format!(
                    "gross-up did not converge for base amount {}",
                    base_amount_cents
                )));
            }
            charge += 1;
            processor_fee_cents = self.processor_fee(charge)?;
            steps += 1;
        }

        let total_fees_cents = processor_fee_cents + platform_fee_cents;
        Ok(FeeBreakdown {
            base_amount_cents,
            processor_fee_cents,
            platform_fee_cents,
            total_fees_cents,
            charge_amount_cents: charge,
            net_amount_cents: charge - total_fees_cents,
            fees_passed_to_member: true,
        })
    }
}

impl Default for FeeCalculator {
    fn default() -> Self {
        Self {
            processor: ProcessorFeeConfig::default(),
        }
    }
}

/// Convenience wrapper around [`FeeCalculator::calculate`].
pub fn calculate_fees(
    base_amount_cents: i64,
    platform_fee: Decimal,
    pass_fees_to_member: bool,
    processor: &ProcessorFeeConfig,
) -> Result<FeeBreakdown> {
    FeeCalculator::new(processor.clone())?.calculate(base_amount_cents, platform_fee, pass_fees_to_member)
}

/// Select the platform fee (major units) that applies to a payment.
///
/// Back dues are charged the monthly platform fee once per credited month.
///
/// # Errors
///
/// Returns `BillingError::InvalidFeeSchedule` if the relevant entry is negative.
pub fn platform_fee_for(
    organization_id: &str,
    schedule: &PlatformFeeSchedule,
    payment_type: PaymentType,
    frequency: BillingFrequency,
    months_credited: u32,
) -> std::result::Result<Decimal, BillingError> {
    let fee = match payment_type {
        PaymentType::EnrollmentFee => schedule.enrollment,
        PaymentType::Dues => match frequency {
            BillingFrequency::Monthly => schedule.monthly,
            BillingFrequency::Biannual => schedule.biannual,
            BillingFrequency::Annual => schedule.annual,
        },
        PaymentType::BackDues => schedule.monthly * Decimal::from(months_credited),
    };

    if fee < Decimal::ZERO {
        return Err(BillingError::InvalidFeeSchedule {
            organization_id: organization_id.to_string(),
            reason: format!("{} platform fee is negative", payment_type),
        });
    }
    Ok(fee)
}

fn to_cents(value: Decimal, field: &str) -> Result<i64> {
    value
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .ok_or_else(|| {
            BillingError::InvalidAmount {
                field: field.to_string(),
                reason: "amount out of range".to_string(),
            }
            .into()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn calculator() -> FeeCalculator {
        FeeCalculator::default()
    }

    #[test]
    fn test_absorbed_fees() {
        let breakdown = calculator().calculate(5000, Decimal::ZERO, false).unwrap();
        assert_eq!(breakdown.charge_amount_cents, 5000);
        assert_eq!(breakdown.processor_fee_cents, 175);
        assert_eq!(breakdown.platform_fee_cents, 0);
        assert_eq!(breakdown.net_amount_cents, 4825);
    }

    #[test]
    fn test_passed_through_fees() {
        let breakdown = calculator().calculate(5000, Decimal::ZERO, true).unwrap();
        assert_eq!(breakdown.charge_amount_cents, 5180);
        assert_eq!(breakdown.processor_fee_cents, 180);
        assert_eq!(breakdown.net_amount_cents, 5000);
    }

    #[test]
    fn test_platform_fee_passed_through() {
        let breakdown = calculator().calculate(5000, dec!(1.50), true).unwrap();
        assert_eq!(breakdown.platform_fee_cents, 150);
        assert_eq!(breakdown.net_amount_cents, 5000);
        assert_eq!(
            breakdown.charge_amount_cents,
            breakdown.net_amount_cents + breakdown.total_fees_cents
        );
    }

    #[test]
    fn test_zero_base_short_circuits() {
        let breakdown = calculator().calculate(0, dec!(2.00), true).unwrap();
        assert_eq!(breakdown.charge_amount_cents, 0);
        assert_eq!(breakdown.processor_fee_cents, 0);
        assert_eq!(breakdown.platform_fee_cents, 0);
        assert_eq!(breakdown.net_amount_cents, 0);
    }

    #[test]
    fn test_negative_inputs_rejected() {
        assert!(matches!(
            calculator().calculate(-1, Decimal::ZERO, false),
            Err(DuesError::Validation(_))
        ));
        assert!(matches!(
            calculator().calculate(100, dec!(-0.01), false),
            Err(DuesError::Validation(_))
        ));
    }

    #[test]
    fn test_half_up_rounding() {
        // 500 * 0.029 + 30 = 44.5
        assert_eq!(calculator().processor_fee(500).unwrap(), 45);
        // 150 * 0.029 + 30 = 34.35
        assert_eq!(calculator().processor_fee(150).unwrap(), 34);
    }

    #[test]
    fn test_invalid_processor_config() {
        assert!(FeeCalculator::new(ProcessorFeeConfig::new(dec!(1), 0)).is_err());
    }

    #[test]
    fn test_platform_fee_selection() {
        let schedule = PlatformFeeSchedule {
            monthly: dec!(1.00),
            biannual: dec!(4.00),
            annual: dec!(7.00),
            enrollment: dec!(2.00),
        };
        let fee = |t, f, m| platform_fee_for("org_1", &schedule, t, f, m).unwrap();
        assert_eq!(fee(PaymentType::Dues, BillingFrequency::Biannual, 6), dec!(4.00));
        assert_eq!(fee(PaymentType::Dues, BillingFrequency::Annual, 12), dec!(7.00));
        assert_eq!(fee(PaymentType::EnrollmentFee, BillingFrequency::Monthly, 0), dec!(2.00));
        assert_eq!(fee(PaymentType::BackDues, BillingFrequency::Monthly, 3), dec!(3.00));

        let bad = PlatformFeeSchedule {
            monthly: dec!(-1),
            ..schedule
        };
        assert!(matches!(
            platform_fee_for("org_1", &bad, PaymentType::Dues, BillingFrequency::Monthly, 1),
            Err(BillingError::InvalidFeeSchedule { .. })
        ));
    }

    proptest! {
        #[test]
        fn prop_absorbed_net_is_base_minus_fees(base in 0i64..10_000_000, platform in 0u32..10_000) {
            let calc = calculator();
            let platform = Decimal::new(platform as i64, 2);
            let breakdown = calc.calculate(base, platform, false).unwrap();
            prop_assert_eq!(breakdown.charge_amount_cents, base);
            if base > 0 {
                let expected = base - calc.processor_fee(base).unwrap() - breakdown.platform_fee_cents;
                prop_assert_eq!(breakdown.net_amount_cents, expected);
            }
        }

        #[test]
        fn prop_gross_up_reproduces_base(base in 1i64..10_000_000, platform in 0u32..10_000) {
            let calc = calculator();
            let platform = Decimal::new(platform as i64, 2);
            let breakdown = calc.calculate(base, platform, true).unwrap();
            let fee = calc.processor_fee(breakdown.charge_amount_cents).unwrap();
            let net = breakdown.charge_amount_cents - fee - breakdown.platform_fee_cents;
            prop_assert!(net >= base);
            prop_assert!(net - base <= 1);
            prop_assert_eq!(net, breakdown.net_amount_cents);
        }
    }
}
