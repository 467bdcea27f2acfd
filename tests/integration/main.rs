mod issuance_flow;
mod issuer_backends;
mod support;
#[cfg(feature = "integration-tests")]
mod venafi_live;
