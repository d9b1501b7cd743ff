//! Tables owned by the framework.

pub mod api_permission_mapping;
pub mod casbin_rule;
pub mod system_config;
