//! Billing records and their closed status enums.
//!
//! Every record carries its `organization_id`; the services in this module
//! refuse to combine records from different organizations.

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::error::BillingError;

/// Error returned when parsing a status or kind string fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEnumError {
    /// Which enum was being parsed.
    pub kind: &'static str,
    /// The rejected input.
    pub value: String,
}

impl fmt::Display for ParseEnumError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: '{}'", self.kind, self.value)
    }
}

impl std::error::Error for ParseEnumError {}

fn parse_error(kind: &'static str, value: &str) -> ParseEnumError {
    ParseEnumError {
        kind,
        value: value.to_string(),
    }
}

/// Generate a prefixed random identifier, e.g. `pay_3f2a...`.
#[must_use]
pub fn new_id(prefix: &str) -> String {
    format!("{}_{}", prefix, Uuid::new_v4().simple())
}

// =============================================================================
// Enums
// =============================================================================

/// How often a membership is billed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingFrequency {
    /// Every month.
    Monthly,
    /// Every six months.
    Biannual,
    /// Every twelve months.
    Annual,
}

impl BillingFrequency {
    /// Number of months one billing period covers.
    #[must_use]
    pub fn months(&self) -> u32 {
        match self {
            Self::Monthly => 1,
            Self::Biannual => 6,
            Self::Annual => 12,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Monthly => "monthly",
            Self::Biannual => "biannual",
            Self::Annual => "annual",
        }
    }
}

impl FromStr for BillingFrequency {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "monthly" | "month" => Ok(Self::Monthly),
            "biannual" | "semiannual" | "semi_annual" => Ok(Self::Biannual),
            "annual" | "yearly" | "year" => Ok(Self::Annual),
            _ => Err(parse_error("billing frequency", s)),
        }
    }
}

impl fmt::Display for BillingFrequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Membership lifecycle state.
///
/// See [`MembershipStatus::can_transition_to`] for the allowed edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipStatus {
    /// Registered, onboarding not finished.
    Pending,
    /// Waiting for the member to sign the agreement.
    AwaitingSignature,
    /// Onboarded, paying, not yet past the eligibility threshold.
    WaitingPeriod,
    /// Fully eligible and in good standing.
    Current,
    /// Fell behind on payments.
    Lapsed,
    /// Terminal.
    Cancelled,
}

impl MembershipStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::AwaitingSignature => "awaiting_signature",
            Self::WaitingPeriod => "waiting_period",
            Self::Current => "current",
            Self::Lapsed => "lapsed",
            Self::Cancelled => "cancelled",
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Whether the forward graph allows moving from `self` to `next`.
    ///
    /// Staying in the same state is always allowed. Admin overrides bypass
    /// this check (except out of `Cancelled`).
    #[must_use]
    pub fn can_transition_to(&self, next: MembershipStatus) -> bool {
        use MembershipStatus::*;
        match (self, next) {
            (Cancelled, Cancelled) => true,
            (Cancelled, _) => false,
            (_, Cancelled) => true,
            (Pending, AwaitingSignature | WaitingPeriod | Current) => true,
            (AwaitingSignature, WaitingPeriod | Current) => true,
            (WaitingPeriod, Current) => true,
            (Current, Lapsed) => true,
            // Reinstatement after a successful payment.
            (Lapsed, Current | WaitingPeriod) => true,
            (Pending, Lapsed)
            | (AwaitingSignature, Pending | Lapsed)
            | (WaitingPeriod, Pending | AwaitingSignature | Lapsed)
            | (Current, Pending | AwaitingSignature | WaitingPeriod)
            | (Lapsed, Pending | AwaitingSignature) => false,
            (Pending, Pending)
            | (AwaitingSignature, AwaitingSignature)
            | (WaitingPeriod, WaitingPeriod)
            | (Current, Current)
            | (Lapsed, Lapsed) => true,
        }
    }
}

impl FromStr for MembershipStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "awaiting_signature" => Ok(Self::AwaitingSignature),
            "waiting_period" => Ok(Self::WaitingPeriod),
            "current" | "active" => Ok(Self::Current),
            "lapsed" => Ok(Self::Lapsed),
            "cancelled" | "canceled" => Ok(Self::Cancelled),
            _ => Err(parse_error("membership status", s)),
        }
    }
}

impl fmt::Display for MembershipStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a payment is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentType {
    /// One-time fee at signup.
    EnrollmentFee,
    /// Regular recurring dues.
    Dues,
    /// Ad-hoc payment covering a custom number of months.
    BackDues,
}

impl PaymentType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EnrollmentFee => "enrollment_fee",
            Self::Dues => "dues",
            Self::BackDues => "back_dues",
        }
    }

    /// Whether settling this payment credits paid months.
    #[must_use]
    pub fn credits_months(&self) -> bool {
        match self {
            Self::Dues | Self::BackDues => true,
            Self::EnrollmentFee => false,
        }
    }
}

impl FromStr for PaymentType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "enrollment_fee" => Ok(Self::EnrollmentFee),
            "dues" => Ok(Self::Dues),
            "back_dues" => Ok(Self::BackDues),
            _ => Err(parse_error("payment type", s)),
        }
    }
}

impl fmt::Display for PaymentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a payment was made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    /// Card or bank payment through the payment processor.
    Processor,
    Cash,
    Check,
    /// Any other manually recorded method.
    Other,
}

impl PaymentMethod {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processor => "processor",
            Self::Cash => "cash",
            Self::Check => "check",
            Self::Other => "other",
        }
    }

    /// Manual methods are recorded by an admin rather than the processor.
    #[must_use]
    pub fn is_manual(&self) -> bool {
        !matches!(self, Self::Processor)
    }
}

impl FromStr for PaymentMethod {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processor" | "stripe" | "card" => Ok(Self::Processor),
            "cash" => Ok(Self::Cash),
            "check" | "cheque" => Ok(Self::Check),
            "other" => Ok(Self::Other),
            _ => Err(parse_error("payment method", s)),
        }
    }
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Settlement state of a payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Succeeded,
    Failed,
}

impl PaymentStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for PaymentStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "succeeded" | "completed" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            _ => Err(parse_error("payment status", s)),
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of the one-time enrollment fee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentFeeStatus {
    Unpaid,
    Paid,
    Waived,
}

impl EnrollmentFeeStatus {
    /// Paid or waived; either way it no longer blocks onboarding.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        matches!(self, Self::Paid | Self::Waived)
    }
}

/// Review state of a membership application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationStatus {
    Pending,
    Approved,
    Rejected,
}

impl ApplicationStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }
}

impl fmt::Display for ApplicationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Records
// =============================================================================

/// Platform fee per payment, in major currency units (e.g. dollars).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformFeeSchedule {
    pub monthly: Decimal,
    pub biannual: Decimal,
    pub annual: Decimal,
    /// Charged on enrollment fee payments.
    #[serde(default)]
    pub enrollment: Decimal,
}

/// Per-organization overrides of the deployment billing config.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrgBillingSettings {
    #[serde(default)]
    pub eligibility_months: Option<u32>,
    #[serde(default)]
    pub reminder_schedule: Option<Vec<u32>>,
    #[serde(default)]
    pub lapse_days: Option<u32>,
}

/// A tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    pub id: String,
    pub name: String,
    /// IANA timezone name, e.g. `America/Chicago`.
    pub timezone: String,
    /// ISO currency code, lower case.
    pub currency: String,
    pub country: String,
    pub platform_fees: PlatformFeeSchedule,
    /// Charge processor and platform fees to the payer instead of absorbing them.
    pub pass_fees_to_member: bool,
    #[serde(default)]
    pub billing_settings: OrgBillingSettings,
}

impl Organization {
    /// Create an organization with zero platform fees and UTC timezone.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            timezone: "UTC".to_string(),
            currency: "usd".to_string(),
            country: "US".to_string(),
            platform_fees: PlatformFeeSchedule::default(),
            pass_fees_to_member: false,
            billing_settings: OrgBillingSettings::default(),
        }
    }

    /// The organization's timezone.
    ///
    /// # Errors
    ///
    /// Returns `BillingError::InvalidTimezone` for unknown zone names.
    pub fn tz(&self) -> Result<Tz, BillingError> {
        self.timezone
            .parse::<Tz>()
            .map_err(|_| BillingError::InvalidTimezone {
                timezone: self.timezone.clone(),
            })
    }
}

/// A pricing tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub organization_id: String,
    pub name: String,
    pub monthly_price_cents: i64,
    pub biannual_price_cents: i64,
    pub annual_price_cents: i64,
    pub enrollment_fee_cents: i64,
    pub is_active: bool,
}

impl Plan {
    /// Base price for one period at `frequency`.
    #[must_use]
    pub fn price_for(&self, frequency: BillingFrequency) -> i64 {
        match frequency {
            BillingFrequency::Monthly => self.monthly_price_cents,
            BillingFrequency::Biannual => self.biannual_price_cents,
            BillingFrequency::Annual => self.annual_price_cents,
        }
    }
}

/// The billing subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub id: String,
    pub organization_id: String,
    pub plan_id: String,
    pub status: MembershipStatus,
    pub billing_frequency: BillingFrequency,
    /// Day of month (1-31) billing is anchored to.
    pub billing_anniversary_day: u32,
    pub paid_months: u32,
    pub next_payment_due: Option<NaiveDate>,
    pub enrollment_fee_status: EnrollmentFeeStatus,
    pub agreement_signed_at: Option<DateTime<Utc>>,
    /// Date the eligibility threshold was first crossed.
    pub eligible_since: Option<NaiveDate>,
    pub processor_customer_id: Option<String>,
    pub processor_subscription_id: Option<String>,
    /// Bumped by the store on every write.
    #[serde(default)]
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Membership {
    /// Create a pending membership anchored on `start`.
    #[must_use]
    pub fn new(
        organization_id: impl Into<String>,
        plan_id: impl Into<String>,
        frequency: BillingFrequency,
        start: NaiveDate,
    ) -> Self {
        use chrono::Datelike;
        let now = Utc::now();
        Self {
            id: new_id("mem"),
            organization_id: organization_id.into(),
            plan_id: plan_id.into(),
            status: MembershipStatus::Pending,
            billing_frequency: frequency,
            billing_anniversary_day: start.day(),
            paid_months: 0,
            next_payment_due: Some(start),
            enrollment_fee_status: EnrollmentFeeStatus::Unpaid,
            agreement_signed_at: None,
            eligible_since: None,
            processor_customer_id: None,
            processor_subscription_id: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn agreement_signed(&self) -> bool {
        self.agreement_signed_at.is_some()
    }

    /// Agreement signed and enrollment fee paid or waived.
    #[must_use]
    pub fn onboarding_complete(&self) -> bool {
        self.agreement_signed() && self.enrollment_fee_status.is_resolved()
    }
}

/// A financial event against one membership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub id: String,
    pub organization_id: String,
    pub membership_id: String,
    pub payment_type: PaymentType,
    pub method: PaymentMethod,
    pub status: PaymentStatus,
    /// Base amount before fees.
    pub amount_cents: i64,
    pub processor_fee_cents: i64,
    pub platform_fee_cents: i64,
    pub total_charged_cents: i64,
    pub net_amount_cents: i64,
    pub months_credited: u32,
    pub invoice_number: String,
    pub due_date: NaiveDate,
    pub period_start: Option<NaiveDate>,
    pub period_end: Option<NaiveDate>,
    pub period_label: Option<String>,
    pub reminder_count: u32,
    pub reminder_sent_at: Option<DateTime<Utc>>,
    pub requires_review: bool,
    pub processor_payment_id: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Payment {
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.status == PaymentStatus::Succeeded
    }

    /// Still awaiting money and not parked for manual handling.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.status == PaymentStatus::Pending && !self.requires_review
    }
}

/// A membership application awaiting review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Application {
    pub id: String,
    pub organization_id: String,
    pub plan_id: String,
    pub applicant_name: String,
    pub email: String,
    pub billing_frequency: BillingFrequency,
    /// First billing date requested by the applicant.
    pub requested_start: NaiveDate,
    pub status: ApplicationStatus,
    pub reviewed_by: Option<String>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub rejection_reason: Option<String>,
    pub membership_id: Option<String>,
    pub created_at: DateTime<Utc>,
}
