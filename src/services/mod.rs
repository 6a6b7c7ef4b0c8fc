//! Business logic services.

pub mod acl_filter;
pub mod acl_service;
pub mod document_service;
pub mod event_bus;
pub mod permission_registry;
pub mod permission_service;
pub mod workflow_actions;
pub mod workflow_service;
