//! Checkout registrations and the idempotent webhook → provisioning bridge.

pub mod postgres;
pub mod provisioning;
pub mod signature;
pub mod store;
pub mod trigger;
pub mod types;

pub use postgres::PostgresRegistrationStore;
pub use provisioning::{
    InMemoryProvisioner, ProvisionError, ProvisionedAccount, Provisioner, ProvisioningError,
    ProvisioningOutcome, ProvisioningService,
};
pub use signature::{SignatureError, WebhookVerifier};
pub use store::{InMemoryRegistrationStore, RegistrationStore};
pub use trigger::{CHECKOUT_COMPLETED, EventTrigger, TriggerOutcome, VerifiedEvent, WebhookEvent};
pub use types::{NewRegistration, PendingRegistration, RegistrationError, RegistrationStatus};
