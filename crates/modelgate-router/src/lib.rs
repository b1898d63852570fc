//! HTTP edge: binds the three dialect endpoints and the model listing to
//! the dispatcher.

mod proxy;

pub use proxy::proxy_router;
