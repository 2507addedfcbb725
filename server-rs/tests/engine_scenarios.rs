mod common;

use chrono::Duration;
use uuid::Uuid;

use common::Harness;
use tenancy_api::audit::AuditEvent;
use tenancy_api::error::AppError;
use tenancy_api::models::{
    AddMemberRequest, BillingEvent, BillingEventData, BillingEventKind, EffectiveState,
    EventOutcome, IdRef, Operation, OperationKind, PlanLimits, ResourceKind, Role,
    SubscriptionStatus, TenantContext, TenantId,
};

fn op(kind: OperationKind, ctx: &TenantContext) -> Operation {
    Operation::new(kind, ctx.tenant.id)
}

fn event(kind: BillingEventKind, h: &Harness, tenant: TenantId) -> BillingEvent {
    BillingEvent {
        id: format!("evt_{}", Uuid::new_v4().simple()),
        kind,
        created: h.now(),
        data: BillingEventData {
            tenant_id: tenant,
            subscription_id: None,
            amount_cents: Some(2_900),
            currency: Some("usd".into()),
            period_start: None,
            period_end: None,
            plan_id: None,
            cancel_at_period_end: None,
        },
    }
}

async fn pay(h: &Harness, tenant: TenantId) {
    let outcome = h
        .engine()
        .subscriptions
        .handle_event(&event(BillingEventKind::PaymentSucceeded, h, tenant))
        .await
        .unwrap();
    assert_eq!(outcome, EventOutcome::Applied);
}

fn small_limits(max_products: i64) -> PlanLimits {
    PlanLimits {
        max_users: Some(5),
        max_products: Some(max_products),
        max_transactions_per_month: Some(2),
        max_storage_bytes: None,
    }
}

#[tokio::test]
async fn sixth_product_exceeds_limit_of_five() {
    let h = Harness::new().await;
    h.publish_limits("starter", small_limits(5)).await;
    let shop = h.onboard("Corner Shop", "starter").await;

    for _ in 0..5 {
        h.engine()
            .enforcement
            .authorize(&shop.ctx, &op(OperationKind::ProductCreate, &shop.ctx))
            .await
            .unwrap();
    }
    let err = h
        .engine()
        .enforcement
        .authorize(&shop.ctx, &op(OperationKind::ProductCreate, &shop.ctx))
        .await
        .unwrap_err();

    match err {
        AppError::LimitExceeded {
            resource,
            current,
            limit,
        } => {
            assert_eq!(resource, ResourceKind::Products);
            assert_eq!(current, 5);
            assert_eq!(limit, 5);
        }
        other => panic!("expected LimitExceeded, got {other:?}"),
    }

    let warnings = h
        .audit
        .events()
        .into_iter()
        .filter(|e| matches!(e, AuditEvent::LimitWarning { .. }))
        .count();
    assert_eq!(warnings, 2);
    assert_eq!(
        h.engine()
            .usage
            .current(shop.ctx.tenant.id, ResourceKind::Products)
            .await
            .unwrap(),
        5
    );
}

#[tokio::test]
async fn expired_trial_blocks_sales_but_not_reads() {
    let h = Harness::new().await;
    let shop = h.onboard("Trial Shop", "starter").await;
    let tenant = shop.ctx.tenant.id;

    h.clock.advance(Duration::days(15));

    let err = h
        .engine()
        .enforcement
        .authorize(&shop.ctx, &op(OperationKind::SaleCreate, &shop.ctx))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::SubscriptionInactive(_)));

    h.engine()
        .enforcement
        .authorize(&shop.ctx, &op(OperationKind::SaleList, &shop.ctx))
        .await
        .unwrap();

    let standing = h.engine().subscriptions.standing(tenant).await.unwrap();
    assert_eq!(standing.subscription.status, SubscriptionStatus::PastDue);
    assert_eq!(standing.effective.state, EffectiveState::PastDue);

    let transitions: Vec<_> = h
        .audit
        .events()
        .into_iter()
        .filter(|e| matches!(e, AuditEvent::SubscriptionTransition { .. }))
        .collect();
    assert_eq!(transitions.len(), 1);
}

#[tokio::test]
async fn managers_cannot_invite_users() {
    let h = Harness::new().await;
    let shop = h.onboard("Staffed Shop", "starter").await;
    let (_, manager) = h.add_member(&shop, Role::Manager).await;

    let err = h
        .engine()
        .enforcement
        .authorize(&manager, &op(OperationKind::UserInvite, &manager))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::AccessDenied(_)));

    let err = h
        .engine()
        .directory
        .add_member(
            &manager,
            AddMemberRequest {
                user: IdRef::Bare(tenancy_api::models::UserId::new()),
                role: Role::Staff,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::AccessDenied(_)));
    assert!(!h.audit.denials().is_empty());

    // the denied invites reserved nothing
    assert_eq!(
        h.engine()
            .usage
            .current(shop.ctx.tenant.id, ResourceKind::Users)
            .await
            .unwrap(),
        2
    );
}

#[tokio::test]
async fn cancellation_keeps_access_until_period_end() {
    let h = Harness::new().await;
    let shop = h.onboard("Leaving Shop", "starter").await;
    let tenant = shop.ctx.tenant.id;
    pay(&h, tenant).await;

    let standing = h.engine().subscriptions.standing(tenant).await.unwrap();
    assert_eq!(standing.subscription.status, SubscriptionStatus::Active);
    h.clock
        .set(standing.subscription.current_period_end - Duration::days(3));

    let cancelled = h.engine().subscriptions.cancel(tenant).await.unwrap();
    assert!(cancelled.effective.cancel_pending);
    assert_eq!(cancelled.effective.state, EffectiveState::Active);

    h.engine()
        .enforcement
        .authorize(&shop.ctx, &op(OperationKind::ProductCreate, &shop.ctx))
        .await
        .unwrap();

    h.clock.advance(Duration::days(3) + Duration::seconds(1));

    let err = h
        .engine()
        .enforcement
        .authorize(&shop.ctx, &op(OperationKind::ProductCreate, &shop.ctx))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::SubscriptionInactive(_)));

    // export and billing history stay reachable
    h.engine()
        .enforcement
        .authorize(&shop.ctx, &op(OperationKind::DataExport, &shop.ctx))
        .await
        .unwrap();
    h.engine()
        .enforcement
        .authorize(&shop.ctx, &op(OperationKind::BillingView, &shop.ctx))
        .await
        .unwrap();
    assert_eq!(
        h.engine().subscriptions.history(tenant).await.unwrap().len(),
        1
    );
}

#[tokio::test]
async fn plan_change_is_refused_while_cancellation_is_pending() {
    let h = Harness::new().await;
    let shop = h.onboard("Undecided Shop", "starter").await;
    let tenant = shop.ctx.tenant.id;
    pay(&h, tenant).await;
    h.engine().subscriptions.cancel(tenant).await.unwrap();

    let pro = h.engine().plans.latest("pro").await.unwrap();
    let err = h
        .engine()
        .subscriptions
        .change_plan(tenant, pro.id, None)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));
}

#[tokio::test]
async fn payloads_naming_another_tenant_are_denied() {
    let h = Harness::new().await;
    let a = h.onboard("Shop A", "starter").await;
    let b = h.onboard("Shop B", "starter").await;

    for kind in [
        OperationKind::ProductList,
        OperationKind::ProductCreate,
        OperationKind::BillingView,
    ] {
        let err = h
            .engine()
            .enforcement
            .authorize(&a.ctx, &Operation::new(kind, b.ctx.tenant.id))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::AccessDenied(_)), "{kind:?}");
    }

    // nothing was metered on either side
    for tenant in [a.ctx.tenant.id, b.ctx.tenant.id] {
        assert_eq!(
            h.engine()
                .usage
                .current(tenant, ResourceKind::Products)
                .await
                .unwrap(),
            0
        );
    }

    // membership in A does not resolve a context for B
    let err = h
        .engine()
        .resolver
        .resolve_for(a.ctx.principal, Some(&b.ctx.tenant.id.to_string()))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotAMember));
}

#[tokio::test]
async fn missing_or_disabled_tenants_do_not_resolve() {
    let h = Harness::new().await;
    let shop = h.onboard("Closing Shop", "starter").await;

    let err = h
        .engine()
        .resolver
        .resolve_for(shop.ctx.principal, None)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::TenantHintRequired));

    h.engine().directory.disable(&shop.ctx).await.unwrap();
    let err = h
        .engine()
        .resolver
        .resolve_for(shop.ctx.principal, Some(&shop.ctx.tenant.id.to_string()))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::TenantNotFound));

    let mine = h
        .engine()
        .directory
        .memberships_for(shop.ctx.principal)
        .await
        .unwrap();
    assert!(mine.is_empty());
}

#[tokio::test]
async fn tenant_always_keeps_an_admin() {
    let h = Harness::new().await;
    let shop = h.onboard("Solo Shop", "starter").await;
    let owner = shop.owner;

    let err = h
        .engine()
        .directory
        .remove_member(&shop.ctx, owner)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::CannotRemoveLastAdmin));

    let err = h
        .engine()
        .directory
        .change_role(&shop.ctx, owner, Role::Staff)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::CannotRemoveLastAdmin));

    let (admin, admin_ctx) = h.add_member(&shop, Role::Admin).await;

    // admins cannot touch the owner
    let err = h
        .engine()
        .directory
        .remove_member(&admin_ctx, owner)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::AccessDenied(_)));

    h.engine()
        .directory
        .remove_member(&shop.ctx, owner)
        .await
        .unwrap();

    let roster = h.engine().directory.roster(&admin_ctx).await.unwrap();
    assert_eq!(roster.len(), 1);
    assert_eq!(roster[0].user_id, admin);
    assert_eq!(
        h.engine()
            .usage
            .current(shop.ctx.tenant.id, ResourceKind::Users)
            .await
            .unwrap(),
        1
    );

    let err = h
        .engine()
        .directory
        .remove_member(&admin_ctx, admin)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::CannotRemoveLastAdmin));
}

#[tokio::test]
async fn webhook_events_apply_once() {
    let h = Harness::new().await;
    let shop = h.onboard("Paying Shop", "starter").await;
    let tenant = shop.ctx.tenant.id;
    let paid = event(BillingEventKind::PaymentSucceeded, &h, tenant);

    let first = h.engine().subscriptions.handle_event(&paid).await.unwrap();
    assert_eq!(first, EventOutcome::Applied);
    let after_first = h.engine().subscriptions.current(tenant).await.unwrap();

    let err = h
        .engine()
        .subscriptions
        .handle_event(&paid)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::DuplicateWebhookEvent(_)));

    let after_second = h.engine().subscriptions.current(tenant).await.unwrap();
    assert_eq!(after_first.version, after_second.version);
    assert_eq!(after_second.status, SubscriptionStatus::Active);
    assert!(h
        .audit
        .events()
        .iter()
        .any(|e| matches!(e, AuditEvent::DuplicateWebhook { .. })));
    assert_eq!(h.engine().subscriptions.history(tenant).await.unwrap().len(), 1);
}

#[tokio::test]
async fn failed_payment_and_recovery() {
    let h = Harness::new().await;
    let shop = h.onboard("Wobbly Shop", "starter").await;
    let tenant = shop.ctx.tenant.id;
    pay(&h, tenant).await;

    h.engine()
        .subscriptions
        .handle_event(&event(BillingEventKind::PaymentFailed, &h, tenant))
        .await
        .unwrap();
    let standing = h.engine().subscriptions.standing(tenant).await.unwrap();
    assert_eq!(standing.subscription.status, SubscriptionStatus::PastDue);

    // edits that add no usage still pass while past due
    let err = h
        .engine()
        .enforcement
        .authorize(&shop.ctx, &op(OperationKind::ProductCreate, &shop.ctx))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::SubscriptionInactive(_)));
    h.engine()
        .enforcement
        .authorize(&shop.ctx, &op(OperationKind::ProductUpdate, &shop.ctx))
        .await
        .unwrap();

    pay(&h, tenant).await;
    h.engine()
        .enforcement
        .authorize(&shop.ctx, &op(OperationKind::ProductCreate, &shop.ctx))
        .await
        .unwrap();
}

#[tokio::test]
async fn downgrade_is_blocked_only_while_stock_exceeds_target() {
    let h = Harness::new().await;
    let shop = h.onboard("Growing Shop", "pro").await;
    let tenant = shop.ctx.tenant.id;
    pay(&h, tenant).await;

    for _ in 0..3 {
        h.engine()
            .enforcement
            .authorize(&shop.ctx, &op(OperationKind::ProductCreate, &shop.ctx))
            .await
            .unwrap();
    }
    let tiny = h
        .publish_limits(
            "free",
            PlanLimits {
                max_users: Some(2),
                max_products: Some(2),
                max_transactions_per_month: Some(200),
                max_storage_bytes: None,
            },
        )
        .await;

    let err = h
        .engine()
        .subscriptions
        .change_plan(tenant, tiny.id, None)
        .await
        .unwrap_err();
    match err {
        AppError::PlanDowngradeBlocked(violations) => {
            assert_eq!(violations.len(), 1);
            assert_eq!(violations[0].resource, ResourceKind::Products);
            assert_eq!(violations[0].current, 3);
            assert_eq!(violations[0].limit, 2);
        }
        other => panic!("expected PlanDowngradeBlocked, got {other:?}"),
    }

    h.engine()
        .enforcement
        .authorize(&shop.ctx, &op(OperationKind::ProductDelete, &shop.ctx))
        .await
        .unwrap();

    let standing = h
        .engine()
        .subscriptions
        .change_plan(tenant, tiny.id, None)
        .await
        .unwrap();
    assert_eq!(standing.plan.id, tiny.id);
    assert_eq!(standing.subscription.status, SubscriptionStatus::Active);
}

#[tokio::test]
async fn provider_plan_change_over_limits_is_recorded_not_applied() {
    let h = Harness::new().await;
    let shop = h.onboard("Synced Shop", "pro").await;
    let tenant = shop.ctx.tenant.id;
    pay(&h, tenant).await;
    for _ in 0..3 {
        h.engine()
            .enforcement
            .authorize(&shop.ctx, &op(OperationKind::ProductCreate, &shop.ctx))
            .await
            .unwrap();
    }
    let tiny = h.publish_limits("free", small_limits(1)).await;
    let before = h.engine().subscriptions.current(tenant).await.unwrap();

    let mut update = event(BillingEventKind::SubscriptionUpdated, &h, tenant);
    update.data.plan_id = Some(tiny.id);
    update.data.period_end = Some(before.current_period_end + Duration::days(1));

    let outcome = h
        .engine()
        .subscriptions
        .handle_event(&update)
        .await
        .unwrap();
    assert_eq!(outcome, EventOutcome::Blocked);

    let after = h.engine().subscriptions.current(tenant).await.unwrap();
    assert_eq!(after.plan_id, before.plan_id);
    assert_eq!(
        after.current_period_end,
        before.current_period_end + Duration::days(1)
    );
    assert!(h
        .audit
        .events()
        .iter()
        .any(|e| matches!(e, AuditEvent::PlanChangeBlocked { .. })));
}

#[tokio::test]
async fn grace_period_ends_in_cancellation_and_reactivation_restores_access() {
    let h = Harness::new().await;
    let shop = h.onboard("Lapsed Shop", "starter").await;
    let tenant = shop.ctx.tenant.id;

    h.clock.advance(Duration::days(15));
    assert_eq!(
        h.engine().subscriptions.current(tenant).await.unwrap().status,
        SubscriptionStatus::PastDue
    );

    h.clock.advance(Duration::days(8));
    let err = h
        .engine()
        .enforcement
        .authorize(&shop.ctx, &op(OperationKind::ProductList, &shop.ctx))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::SubscriptionInactive(_)));
    let lapsed = h.engine().subscriptions.current(tenant).await.unwrap();
    assert_eq!(lapsed.status, SubscriptionStatus::Cancelled);

    // payments for a cancelled subscription change nothing
    let outcome = h
        .engine()
        .subscriptions
        .handle_event(&event(BillingEventKind::PaymentSucceeded, &h, tenant))
        .await
        .unwrap();
    assert_eq!(outcome, EventOutcome::Ignored);

    let standing = h
        .engine()
        .subscriptions
        .reactivate(tenant, None, None)
        .await
        .unwrap();
    assert_ne!(standing.subscription.id, lapsed.id);
    assert_eq!(standing.subscription.status, SubscriptionStatus::Active);

    h.engine()
        .enforcement
        .authorize(&shop.ctx, &op(OperationKind::ProductCreate, &shop.ctx))
        .await
        .unwrap();

    let err = h
        .engine()
        .subscriptions
        .reactivate(tenant, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));
}

#[tokio::test]
async fn transactions_reset_each_month() {
    let h = Harness::new().await;
    h.publish_limits("starter", small_limits(5)).await;
    let shop = h.onboard("Busy Shop", "starter").await;
    let tenant = shop.ctx.tenant.id;
    pay(&h, tenant).await;

    for _ in 0..2 {
        h.engine()
            .enforcement
            .authorize(&shop.ctx, &op(OperationKind::SaleCreate, &shop.ctx))
            .await
            .unwrap();
    }
    let err = h
        .engine()
        .enforcement
        .authorize(&shop.ctx, &op(OperationKind::SaleCreate, &shop.ctx))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AppError::LimitExceeded {
            resource: ResourceKind::Transactions,
            ..
        }
    ));

    // refunds never hand quota back
    h.engine()
        .enforcement
        .authorize(&shop.ctx, &op(OperationKind::SaleRefund, &shop.ctx))
        .await
        .unwrap();
    assert_eq!(
        h.engine()
            .usage
            .current(tenant, ResourceKind::Transactions)
            .await
            .unwrap(),
        2
    );

    h.clock.advance(Duration::days(31));
    h.engine()
        .enforcement
        .authorize(&shop.ctx, &op(OperationKind::SaleCreate, &shop.ctx))
        .await
        .unwrap();

    let history = h
        .engine()
        .usage
        .history(tenant, ResourceKind::Transactions)
        .await
        .unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].count, 1);
    assert_eq!(history[1].count, 2);
}

#[tokio::test]
async fn abandoned_grants_give_usage_back() {
    let h = Harness::new().await;
    let shop = h.onboard("Careful Shop", "starter").await;
    let tenant = shop.ctx.tenant.id;

    let grant = h
        .engine()
        .enforcement
        .authorize(
            &shop.ctx,
            &op(OperationKind::FileUpload, &shop.ctx).with_quantity(4_096),
        )
        .await
        .unwrap();
    let reservation = grant.reservation.expect("upload is metered");
    assert_eq!(reservation.delta, 4_096);

    h.engine()
        .enforcement
        .abandon(&shop.ctx, &reservation)
        .await
        .unwrap();
    assert_eq!(
        h.engine()
            .usage
            .current(tenant, ResourceKind::Storage)
            .await
            .unwrap(),
        0
    );

    let other = h.onboard("Other Shop", "starter").await;
    let err = h
        .engine()
        .enforcement
        .abandon(&other.ctx, &reservation)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::AccessDenied(_)));
}

#[tokio::test]
async fn features_gate_operations() {
    let h = Harness::new().await;
    let shop = h.onboard("Plain Shop", "starter").await;

    let err = h
        .engine()
        .enforcement
        .authorize(&shop.ctx, &op(OperationKind::ReportView, &shop.ctx))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::FeatureNotIncluded(_)));

    h.engine()
        .enforcement
        .authorize(&shop.ctx, &op(OperationKind::LoyaltyManage, &shop.ctx))
        .await
        .unwrap();
}
