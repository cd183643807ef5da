/// Path segment holding consumer presence markers below each resource
pub const CLIENTS_KEY: &str = "__informer_clients__";

/// Backend type reported by the etcd informer backend
pub const ETCD_BACKEND_TYPE: &str = "etcd";

/// Prefix of models stored directly in etcd
pub const MODELS_PREFIX: &str = "models";
