use serde::{Deserialize, Serialize};

use super::plan::Feature;
use super::subscription::AccessClass;
use super::tenant::{Role, TenantId, TenantRef};
use super::usage::ResourceKind;

/// Business operations collaborators must enforce before touching tenant data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    #[serde(rename = "product.create")]
    ProductCreate,
    #[serde(rename = "product.update")]
    ProductUpdate,
    #[serde(rename = "product.delete")]
    ProductDelete,
    #[serde(rename = "product.list")]
    ProductList,
    #[serde(rename = "sale.create")]
    SaleCreate,
    #[serde(rename = "sale.refund")]
    SaleRefund,
    #[serde(rename = "sale.list")]
    SaleList,
    #[serde(rename = "customer.create")]
    CustomerCreate,
    #[serde(rename = "customer.list")]
    CustomerList,
    #[serde(rename = "user.invite")]
    UserInvite,
    #[serde(rename = "user.remove")]
    UserRemove,
    #[serde(rename = "user.change_role")]
    UserChangeRole,
    #[serde(rename = "member.list")]
    MemberList,
    #[serde(rename = "file.upload")]
    FileUpload,
    #[serde(rename = "file.delete")]
    FileDelete,
    #[serde(rename = "report.view")]
    ReportView,
    #[serde(rename = "loyalty.manage")]
    LoyaltyManage,
    #[serde(rename = "location.create")]
    LocationCreate,
    #[serde(rename = "usage.view")]
    UsageView,
    #[serde(rename = "data.export")]
    DataExport,
    #[serde(rename = "settings.update")]
    SettingsUpdate,
    #[serde(rename = "tenant.disable")]
    TenantDisable,
    #[serde(rename = "subscription.view")]
    SubscriptionView,
    #[serde(rename = "billing.view")]
    BillingView,
    #[serde(rename = "billing.manage")]
    BillingManage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageEffect {
    Consume(ResourceKind),
    Release(ResourceKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationPolicy {
    pub required_role: Role,
    pub class: AccessClass,
    pub usage: Option<UsageEffect>,
    pub feature: Option<Feature>,
}

impl OperationPolicy {
    const fn new(required_role: Role, class: AccessClass) -> Self {
        Self {
            required_role,
            class,
            usage: None,
            feature: None,
        }
    }

    const fn consumes(mut self, resource: ResourceKind) -> Self {
        self.usage = Some(UsageEffect::Consume(resource));
        self
    }

    const fn releases(mut self, resource: ResourceKind) -> Self {
        self.usage = Some(UsageEffect::Release(resource));
        self
    }

    const fn requires(mut self, feature: Feature) -> Self {
        self.feature = Some(feature);
        self
    }
}

impl OperationKind {
    pub fn name(self) -> &'static str {
        use OperationKind::*;
        match self {
            ProductCreate => "product.create",
            ProductUpdate => "product.update",
            ProductDelete => "product.delete",
            ProductList => "product.list",
            SaleCreate => "sale.create",
            SaleRefund => "sale.refund",
            SaleList => "sale.list",
            CustomerCreate => "customer.create",
            CustomerList => "customer.list",
            UserInvite => "user.invite",
            UserRemove => "user.remove",
            UserChangeRole => "user.change_role",
            MemberList => "member.list",
            FileUpload => "file.upload",
            FileDelete => "file.delete",
            ReportView => "report.view",
            LoyaltyManage => "loyalty.manage",
            LocationCreate => "location.create",
            UsageView => "usage.view",
            DataExport => "data.export",
            SettingsUpdate => "settings.update",
            TenantDisable => "tenant.disable",
            SubscriptionView => "subscription.view",
            BillingView => "billing.view",
            BillingManage => "billing.manage",
        }
    }

    pub fn policy(self) -> OperationPolicy {
        use AccessClass::{Billing, Export, Read, Write};
        use OperationKind::*;
        use ResourceKind::{Products, Storage, Transactions, Users};
        match self {
            ProductCreate => OperationPolicy::new(Role::Manager, Write).consumes(Products),
            ProductUpdate => OperationPolicy::new(Role::Manager, Write),
            ProductDelete => OperationPolicy::new(Role::Manager, Write).releases(Products),
            ProductList => OperationPolicy::new(Role::Staff, Read),
            SaleCreate => OperationPolicy::new(Role::Staff, Write).consumes(Transactions),
            // refunds never give transaction quota back
            SaleRefund => OperationPolicy::new(Role::Manager, Write),
            SaleList => OperationPolicy::new(Role::Staff, Read),
            CustomerCreate => OperationPolicy::new(Role::Staff, Write),
            CustomerList => OperationPolicy::new(Role::Staff, Read),
            UserInvite => OperationPolicy::new(Role::Admin, Write).consumes(Users),
            UserRemove => OperationPolicy::new(Role::Admin, Write).releases(Users),
            UserChangeRole => OperationPolicy::new(Role::Admin, Write),
            MemberList => OperationPolicy::new(Role::Manager, Read),
            FileUpload => OperationPolicy::new(Role::Staff, Write).consumes(Storage),
            FileDelete => OperationPolicy::new(Role::Staff, Write).releases(Storage),
            ReportView => {
                OperationPolicy::new(Role::Manager, Read).requires(Feature::AdvancedAnalytics)
            }
            LoyaltyManage => OperationPolicy::new(Role::Manager, Write).requires(Feature::Loyalty),
            LocationCreate => {
                OperationPolicy::new(Role::Admin, Write).requires(Feature::MultiLocation)
            }
            UsageView => OperationPolicy::new(Role::Manager, Read),
            DataExport => OperationPolicy::new(Role::Admin, Export),
            SettingsUpdate => OperationPolicy::new(Role::Admin, Write),
            TenantDisable => OperationPolicy::new(Role::Owner, Billing),
            SubscriptionView => OperationPolicy::new(Role::Manager, Billing),
            BillingView => OperationPolicy::new(Role::Admin, Billing),
            BillingManage => OperationPolicy::new(Role::Owner, Billing),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageDelta {
    pub resource: ResourceKind,
    pub delta: i64,
}

/// One attempted operation against one tenant's data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Operation {
    pub kind: OperationKind,
    /// Tenant owning the data being touched, as named by the request.
    pub resource_tenant: TenantId,
    /// Units consumed or released: 1 for most resources, bytes for storage.
    pub quantity: i64,
}

impl Operation {
    pub fn new(kind: OperationKind, resource_tenant: TenantId) -> Self {
        Self {
            kind,
            resource_tenant,
            quantity: 1,
        }
    }

    pub fn with_quantity(mut self, quantity: i64) -> Self {
        self.quantity = quantity;
        self
    }

    pub fn policy(&self) -> OperationPolicy {
        self.kind.policy()
    }

    pub fn usage(&self) -> Option<UsageDelta> {
        match self.policy().usage? {
            UsageEffect::Consume(resource) => Some(UsageDelta {
                resource,
                delta: self.quantity,
            }),
            UsageEffect::Release(resource) => Some(UsageDelta {
                resource,
                delta: -self.quantity,
            }),
        }
    }

    pub fn increases_usage(&self) -> bool {
        self.usage().is_some_and(|u| u.delta > 0)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnforceRequest {
    pub operation: OperationKind,
    pub resource_tenant: TenantRef,
    pub quantity: Option<i64>,
}
