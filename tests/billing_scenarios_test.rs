use chrono::{DateTime, NaiveDate, Utc};
use duesledger::billing::{
    calculate_next_billing_date, org_code, Application, ApplicationStatus, ApplicationStore,
    BillingConfig, BillingFrequency, BillingRun, EnrollmentFeeOutcome, FeeCalculator,
    InMemoryBillingStore, MembershipStatus, MembershipStore, OnboardingService, Organization,
    OrganizationStore, Payment, PaymentMethod, PaymentStatus, PaymentStore, PaymentType, Plan,
    PlanStore, ReminderProcessor, SettleRequest, SettlementResult, SettlementService,
};

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn noon(day: NaiveDate) -> DateTime<Utc> {
    day.and_hms_opt(12, 0, 0).unwrap().and_utc()
}

fn plan(enrollment_fee_cents: i64) -> Plan {
    Plan {
        id: "plan_individual".to_string(),
        organization_id: "org_mm".to_string(),
        name: "Individual".to_string(),
        monthly_price_cents: 5000,
        biannual_price_cents: 28000,
        annual_price_cents: 54000,
        enrollment_fee_cents,
        is_active: true,
    }
}

async fn store_with(pass_fees_to_member: bool, enrollment_fee_cents: i64) -> InMemoryBillingStore {
    let store = InMemoryBillingStore::new();
    let mut org = Organization::new("org_mm", "Masjid Muhajireen");
    org.timezone = "America/Chicago".to_string();
    org.pass_fees_to_member = pass_fees_to_member;
    store.save_organization(&org).await.unwrap();
    store.save_plan(&plan(enrollment_fee_cents)).await.unwrap();
    store
}

fn application(start: NaiveDate) -> Application {
    Application {
        id: "app_1".to_string(),
        organization_id: "org_mm".to_string(),
        plan_id: "plan_individual".to_string(),
        applicant_name: "Yusuf Ibrahim".to_string(),
        email: "yusuf@example.org".to_string(),
        billing_frequency: BillingFrequency::Monthly,
        requested_start: start,
        status: ApplicationStatus::Pending,
        reviewed_by: None,
        reviewed_at: None,
        rejection_reason: None,
        membership_id: None,
        created_at: Utc::now(),
    }
}

fn open_payment(due: NaiveDate) -> Payment {
    Payment {
        id: "pay_reminders".to_string(),
        organization_id: "org_mm".to_string(),
        membership_id: "mem_1".to_string(),
        payment_type: PaymentType::Dues,
        method: PaymentMethod::Processor,
        status: PaymentStatus::Pending,
        amount_cents: 5000,
        processor_fee_cents: 175,
        platform_fee_cents: 0,
        total_charged_cents: 5000,
        net_amount_cents: 4825,
        months_credited: 1,
        invoice_number: "INV-MM-202501-0001".to_string(),
        due_date: due,
        period_start: Some(due),
        period_end: Some(date(2025, 1, 31)),
        period_label: Some("January 2025".to_string()),
        reminder_count: 0,
        reminder_sent_at: None,
        requires_review: false,
        processor_payment_id: None,
        paid_at: None,
        failure_reason: None,
        created_at: Utc::now(),
    }
}

#[tokio::test]
async fn test_monthly_dues_with_absorbed_fees() {
    let store = store_with(false, 0).await;
    assert_eq!(org_code("Masjid Muhajireen"), "MM");

    let membership = duesledger::billing::Membership::new(
        "org_mm",
        "plan_individual",
        BillingFrequency::Monthly,
        date(2025, 1, 1),
    );
    store.create_membership(&membership).await.unwrap();

    let run = BillingRun::new(store.clone(), BillingConfig::default(), FeeCalculator::default());
    let report = run.run_for_organization("org_mm", date(2025, 1, 1)).await.unwrap();
    let payment = store.get_payment(&report.created[0]).await.unwrap().unwrap();

    assert_eq!(payment.invoice_number, "INV-MM-202501-0001");
    assert_eq!(payment.total_charged_cents, 5000);
    assert_eq!(payment.processor_fee_cents, 175);
    assert_eq!(payment.net_amount_cents, 4825);
}

#[tokio::test]
async fn test_monthly_dues_with_passed_through_fees() {
    let store = store_with(true, 0).await;
    let membership = duesledger::billing::Membership::new(
        "org_mm",
        "plan_individual",
        BillingFrequency::Monthly,
        date(2025, 1, 1),
    );
    store.create_membership(&membership).await.unwrap();

    let run = BillingRun::new(store.clone(), BillingConfig::default(), FeeCalculator::default());
    let report = run.run_for_organization("org_mm", date(2025, 1, 1)).await.unwrap();
    let payment = store.get_payment(&report.created[0]).await.unwrap().unwrap();

    assert_eq!(payment.total_charged_cents, 5180);
    assert_eq!(payment.processor_fee_cents, 180);
    assert_eq!(payment.net_amount_cents, 5000);
}

#[test]
fn test_month_end_anchor_without_and_with_flag() {
    let feb = calculate_next_billing_date(date(2025, 1, 31), BillingFrequency::Monthly, false);
    assert_eq!(feb, date(2025, 2, 28));
    let mar = calculate_next_billing_date(feb, BillingFrequency::Monthly, false);
    assert_eq!(mar, date(2025, 3, 28));

    let feb = calculate_next_billing_date(date(2025, 1, 31), BillingFrequency::Monthly, true);
    assert_eq!(feb, date(2025, 2, 28));
    let mar = calculate_next_billing_date(feb, BillingFrequency::Monthly, true);
    assert_eq!(mar, date(2025, 3, 31));
}

#[tokio::test]
async fn test_reminder_escalation() {
    let store = store_with(false, 0).await;
    store.create_payment(&open_payment(date(2025, 1, 1))).await.unwrap();
    let processor = ReminderProcessor::new(store.clone(), BillingConfig::default());

    let report = processor.process_organization("org_mm", date(2025, 1, 3)).await.unwrap();
    assert_eq!(report.sent, 0);

    let report = processor.process_organization("org_mm", date(2025, 1, 4)).await.unwrap();
    assert_eq!(report.sent, 1);

    // Same day again: cooldown.
    let report = processor.process_organization("org_mm", date(2025, 1, 4)).await.unwrap();
    assert_eq!(report.sent, 0);

    let report = processor.process_organization("org_mm", date(2025, 1, 8)).await.unwrap();
    assert_eq!(report.sent, 1);

    let report = processor.process_organization("org_mm", date(2025, 1, 15)).await.unwrap();
    assert_eq!(report.sent, 1);
    assert_eq!(report.flagged_for_review, 1);

    let payment = store.get_payment("pay_reminders").await.unwrap().unwrap();
    assert_eq!(payment.reminder_count, 3);
    assert!(payment.requires_review);

    let report = processor.process_organization("org_mm", date(2025, 1, 31)).await.unwrap();
    assert_eq!(report.checked, 0);
    assert_eq!(report.sent, 0);
}

#[tokio::test]
async fn test_application_to_eligibility() {
    let store = store_with(false, 2500).await;
    store.save_application(&application(date(2025, 1, 31))).await.unwrap();
    let config = BillingConfig::default();

    let onboarding = OnboardingService::new(store.clone());
    let run = BillingRun::new(store.clone(), config.clone(), FeeCalculator::default());
    let settlement = SettlementService::new(store.clone(), config);

    let approved = onboarding.approve_application("app_1", "admin_1").await.unwrap();
    let membership_id = approved.membership.id.clone();
    assert_eq!(approved.membership.status, MembershipStatus::Pending);

    // Enrollment fee first.
    let EnrollmentFeeOutcome::Created(fee) = run
        .create_enrollment_fee_payment(&membership_id, date(2025, 1, 31))
        .await
        .unwrap()
    else {
        panic!("enrollment fee payment not created");
    };
    assert_eq!(fee.invoice_number, "INV-MM-202501-0001");
    settlement
        .settle_payment(SettleRequest::new(&fee.id, PaymentMethod::Cash, noon(date(2025, 1, 31))))
        .await
        .unwrap();
    let membership = store.get_membership(&membership_id).await.unwrap().unwrap();
    assert_eq!(membership.status, MembershipStatus::AwaitingSignature);

    let membership = settlement
        .record_agreement_signed(&membership_id, noon(date(2025, 1, 31)))
        .await
        .unwrap();
    assert_eq!(membership.status, MembershipStatus::WaitingPeriod);

    // Six monthly periods anchored on the 31st.
    let expected_due = [
        date(2025, 1, 31),
        date(2025, 2, 28),
        date(2025, 3, 31),
        date(2025, 4, 30),
        date(2025, 5, 31),
        date(2025, 6, 30),
    ];
    for (i, due) in expected_due.iter().enumerate() {
        let membership = store.get_membership(&membership_id).await.unwrap().unwrap();
        assert_eq!(membership.next_payment_due, Some(*due));

        let report = run.run_for_organization("org_mm", *due).await.unwrap();
        assert_eq!(report.created.len(), 1, "period {}", i);

        let result = settlement
            .settle_payment(SettleRequest::new(&report.created[0], PaymentMethod::Processor, noon(*due)))
            .await
            .unwrap();
        let SettlementResult::Settled(outcome) = result else {
            panic!("period {} not settled", i);
        };
        assert_eq!(outcome.new_paid_months, i as u32 + 1);
    }

    let membership = store.get_membership(&membership_id).await.unwrap().unwrap();
    assert_eq!(membership.status, MembershipStatus::Current);
    assert_eq!(membership.paid_months, 6);
    assert_eq!(membership.eligible_since, Some(date(2025, 6, 30)));
    assert_eq!(membership.next_payment_due, Some(date(2025, 7, 31)));

    let dues: Vec<_> = store
        .payments_for_organization("org_mm")
        .into_iter()
        .filter(|p| p.payment_type == PaymentType::Dues)
        .collect();
    assert_eq!(dues.len(), 6);
    assert!(dues.iter().all(|p| p.is_settled()));
    let feb = dues
        .iter()
        .find(|p| p.period_start == Some(date(2025, 2, 28)))
        .unwrap();
    assert_eq!(feb.period_end, Some(date(2025, 3, 30)));
    assert_eq!(feb.period_label.as_deref(), Some("February 2025"));
}

#[tokio::test]
async fn test_settle_twice_credits_once() {
    let store = store_with(false, 0).await;
    let membership = duesledger::billing::Membership::new(
        "org_mm",
        "plan_individual",
        BillingFrequency::Monthly,
        date(2025, 1, 1),
    );
    store.create_membership(&membership).await.unwrap();
    let run = BillingRun::new(store.clone(), BillingConfig::default(), FeeCalculator::default());
    let report = run.run_for_organization("org_mm", date(2025, 1, 1)).await.unwrap();

    let settlement = SettlementService::new(store.clone(), BillingConfig::default());
    let request = SettleRequest::new(&report.created[0], PaymentMethod::Cash, noon(date(2025, 1, 2)));

    assert!(settlement.settle_payment(request.clone()).await.unwrap().is_settled());
    let second = settlement.settle_payment(request).await.unwrap();
    assert!(matches!(second, SettlementResult::AlreadySettled { paid_months: 1, .. }));

    let stored = store.get_membership(&membership.id).await.unwrap().unwrap();
    assert_eq!(stored.paid_months, 1);
}
