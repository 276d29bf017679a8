pub mod credentials;
pub mod recovery_service;
pub mod storage_client;
