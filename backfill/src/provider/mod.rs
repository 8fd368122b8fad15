mod http;
pub mod models;

pub use self::http::{
    CometRpcError, CometRpcErrorExt, CometRpcProvider, CometRpcProviderOptions, CometRpcRequest,
};
pub use self::models::BlockWithResults;
