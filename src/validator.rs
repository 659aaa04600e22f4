//! Validator Adapter (spec.md §4.6).
//!
//! Runs after the Write Engine stages a transaction's mutations: deletes
//! validate and apply first, then creates, then updates, per spec.md §4.6.
//! A validator observes pre-state only; it never mutates the transaction
//! itself (it would otherwise see its own effects on a later pass).

use uuid::Uuid;

use crate::error::{Error, Result, ValidationError, ValidatorCode};
use crate::idl::{MemoryIdl, Transaction};
use crate::schema::Schema;
use crate::write_engine::{PendingChange, WriteOp};

/// Implemented by plugins registered against a table name (spec.md §4.6).
pub trait Validator: Send + Sync {
    fn table(&self) -> &str;

    fn validate_modification(
        &self,
        _is_new: bool,
        _row: Uuid,
        _parent_row: Option<Uuid>,
        _schema: &Schema,
        _idl: &MemoryIdl,
    ) -> std::result::Result<(), ValidationError> {
        Ok(())
    }

    fn validate_deletion(&self, _row: Uuid, _parent_row: Option<Uuid>, _schema: &Schema, _idl: &MemoryIdl) -> std::result::Result<(), ValidationError> {
        Ok(())
    }
}

#[derive(Default)]
pub struct ValidatorRegistry {
    validators: Vec<Box<dyn Validator>>,
}

impl ValidatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, validator: Box<dyn Validator>) {
        self.validators.push(validator);
    }

    fn for_table<'a>(&'a self, table: &'a str) -> impl Iterator<Item = &'a dyn Validator> {
        self.validators.iter().filter(move |v| v.table() == table).map(|v| v.as_ref())
    }

    /// Run every registered validator over a transaction's staged changes,
    /// in delete-then-create-then-update order (spec.md §4.6 step order).
    /// On success the transaction is committed; on failure the caller must
    /// discard the transaction without committing.
    pub fn run(&self, schema: &Schema, idl: &MemoryIdl, txn: &Transaction, changes: &[PendingChange]) -> Result<()> {
        let mut errors = Vec::new();

        for change in changes.iter().filter(|c| c.op == WriteOp::Delete) {
            for validator in self.for_table(&change.table) {
                if let Err(e) = validator.validate_deletion(change.row, change.parent_row, schema, idl) {
                    errors.push(e);
                }
            }
        }
        if let Some(first) = errors.into_iter().next() {
            return Err(Error::Validation(first));
        }

        for change in changes.iter().filter(|c| c.op == WriteOp::Create) {
            let mut errs = Vec::new();
            for validator in self.for_table(&change.table) {
                if let Err(e) = validator.validate_modification(true, change.row, change.parent_row, schema, idl) {
                    errs.push(e);
                }
            }
            if let Some(first) = errs.into_iter().next() {
                return Err(Error::Validation(first));
            }
        }

        for change in changes.iter().filter(|c| c.op == WriteOp::Update) {
            let mut errs = Vec::new();
            for validator in self.for_table(&change.table) {
                if let Err(e) = validator.validate_modification(false, change.row, change.parent_row, schema, idl) {
                    errs.push(e);
                }
            }
            if let Some(first) = errs.into_iter().next() {
                return Err(Error::Validation(first));
            }
        }

        Ok(())
    }
}

/// "No explicit add/delete of websocket subscribers": creating or deleting
/// a `Subscriber` row through the ordinary REST surface is rejected; only
/// the WebSocket lifecycle (§4.9) may do so.
pub struct SubscriberLifecycleValidator;

impl Validator for SubscriberLifecycleValidator {
    fn table(&self) -> &str {
        "Subscriber"
    }

    fn validate_modification(&self, is_new: bool, _row: Uuid, _parent_row: Option<Uuid>, _schema: &Schema, _idl: &MemoryIdl) -> std::result::Result<(), ValidationError> {
        if is_new {
            return Err(ValidationError::new(ValidatorCode::MethodProhibited, "subscribers may only be created by the WebSocket lifecycle"));
        }
        Ok(())
    }

    fn validate_deletion(&self, _row: Uuid, _parent_row: Option<Uuid>, _schema: &Schema, _idl: &MemoryIdl) -> std::result::Result<(), ValidationError> {
        Err(ValidationError::new(ValidatorCode::MethodProhibited, "subscribers may only be deleted by the WebSocket lifecycle"))
    }
}

/// "No duplicate subscription resource URI per subscriber" plus a
/// resource-URI validity check, both run on `Subscription` create.
pub struct SubscriptionValidator;

impl Validator for SubscriptionValidator {
    fn table(&self) -> &str {
        "Subscription"
    }

    fn validate_modification(&self, is_new: bool, row: Uuid, parent_row: Option<Uuid>, schema: &Schema, idl: &MemoryIdl) -> std::result::Result<(), ValidationError> {
        if !is_new {
            return Ok(());
        }
        let Some(subscription) = idl.row("Subscription", row) else {
            return Ok(());
        };
        let Some(resource_uri) = subscription.get("resource").and_then(|v| v.as_str().map(str::to_owned)) else {
            return Err(ValidationError::new(ValidatorCode::VerificationFailed, "subscription missing `resource`"));
        };

        if crate::uri::resolve(&resource_uri, schema, idl).is_err() {
            return Err(ValidationError::new(ValidatorCode::VerificationFailed, format!("subscription resource `{resource_uri}` does not resolve")));
        }

        let Some(owner) = parent_row else {
            return Ok(());
        };
        let duplicate = idl.rows("Subscription").into_iter().any(|other| {
            other.uuid != row
                && other.get("subscriber").and_then(|v| v.as_uuid()) == Some(owner)
                && other.get("resource").and_then(|v| v.as_str().map(str::to_owned)) == Some(resource_uri.clone())
        });
        if duplicate {
            return Err(ValidationError::new(ValidatorCode::DuplicateResource, format!("duplicate subscription for `{resource_uri}`")));
        }
        Ok(())
    }
}

pub fn default_registry() -> ValidatorRegistry {
    let mut registry = ValidatorRegistry::new();
    registry.register(Box::new(SubscriberLifecycleValidator));
    registry.register(Box::new(SubscriptionValidator));
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    #[test]
    fn rejects_a_subscriber_created_outside_the_ws_lifecycle() {
        let validator = SubscriberLifecycleValidator;
        let idl = MemoryIdl::new();
        let schema = testutil::schema();
        let subscriber = testutil::insert_subscriber(&idl);

        let err = validator.validate_modification(true, subscriber, None, &schema, &idl).unwrap_err();
        assert_eq!(err.code, ValidatorCode::MethodProhibited);
    }

    #[test]
    fn rejects_subscriber_deletion_outside_the_ws_lifecycle() {
        let validator = SubscriberLifecycleValidator;
        let idl = MemoryIdl::new();
        let schema = testutil::schema();
        let subscriber = testutil::insert_subscriber(&idl);

        let err = validator.validate_deletion(subscriber, None, &schema, &idl).unwrap_err();
        assert_eq!(err.code, ValidatorCode::MethodProhibited);
    }

    #[test]
    fn allows_a_subscriber_update() {
        let validator = SubscriberLifecycleValidator;
        let idl = MemoryIdl::new();
        let schema = testutil::schema();
        let subscriber = testutil::insert_subscriber(&idl);

        assert!(validator.validate_modification(false, subscriber, None, &schema, &idl).is_ok());
    }

    #[test]
    fn rejects_a_subscription_whose_resource_does_not_resolve() {
        let validator = SubscriptionValidator;
        let idl = MemoryIdl::new();
        let schema = testutil::schema();
        testutil::seed_system(&idl);
        let subscriber = testutil::insert_subscriber(&idl);
        let subscription = testutil::insert_subscription(&idl, subscriber, "/rest/v1/system/bogus");

        let err = validator
            .validate_modification(true, subscription, Some(subscriber), &schema, &idl)
            .unwrap_err();
        assert_eq!(err.code, ValidatorCode::VerificationFailed);
    }

    #[test]
    fn rejects_a_duplicate_subscription_for_the_same_subscriber() {
        let validator = SubscriptionValidator;
        let idl = MemoryIdl::new();
        let schema = testutil::schema();
        testutil::seed_system(&idl);
        testutil::insert_vrf(&idl, "vrf_default");
        let subscriber = testutil::insert_subscriber(&idl);
        let resource = "/rest/v1/system/vrfs/vrf_default";
        testutil::insert_subscription(&idl, subscriber, resource);
        let second = testutil::insert_subscription(&idl, subscriber, resource);

        let err = validator
            .validate_modification(true, second, Some(subscriber), &schema, &idl)
            .unwrap_err();
        assert_eq!(err.code, ValidatorCode::DuplicateResource);
    }

    #[test]
    fn allows_distinct_resources_for_the_same_subscriber() {
        let validator = SubscriptionValidator;
        let idl = MemoryIdl::new();
        let schema = testutil::schema();
        testutil::seed_system(&idl);
        testutil::insert_vrf(&idl, "vrf_default");
        let subscriber = testutil::insert_subscriber(&idl);
        testutil::insert_subscription(&idl, subscriber, "/rest/v1/system/vrfs/vrf_default");
        let second = testutil::insert_subscription(&idl, subscriber, "/rest/v1/system/vrfs");

        assert!(validator
            .validate_modification(true, second, Some(subscriber), &schema, &idl)
            .is_ok());
    }

    #[test]
    fn registry_rejects_a_staged_subscriber_creation() {
        let registry = default_registry();
        let idl = MemoryIdl::new();
        let schema = testutil::schema();
        let subscriber = testutil::insert_subscriber(&idl);
        let txn = idl.open_transaction();

        let changes = vec![PendingChange {
            op: WriteOp::Create,
            table: "Subscriber".to_owned(),
            row: subscriber,
            parent_table: None,
            parent_row: None,
        }];
        let err = registry.run(&schema, &idl, &txn, &changes).unwrap_err();
        assert!(matches!(err, Error::Validation(ref e) if e.code == ValidatorCode::MethodProhibited));
    }
}
