pub mod acl_rule;
pub mod action;
pub mod auth_role;
pub mod authorization_log;
pub mod external_id;
pub mod job_execution;
pub mod principal;
pub mod principal_role;
pub mod realm;
pub mod resource;
pub mod resource_type;

pub use acl_rule::Entity as AclRule;
pub use action::Entity as Action;
pub use auth_role::Entity as AuthRole;
pub use authorization_log::Entity as AuthorizationLog;
pub use external_id::Entity as ExternalId;
pub use job_execution::Entity as JobExecution;
pub use principal::Entity as Principal;
pub use principal_role::Entity as PrincipalRole;
pub use realm::Entity as Realm;
pub use resource::Entity as Resource;
pub use resource_type::Entity as ResourceType;
