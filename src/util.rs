use anyhow::anyhow;
use sentry_core::protocol::SpanStatus;
use std::any::Any;
use std::future::Future;

/// Turn the payload of a caught panic into an error.
pub(crate) fn try_to_extract_panic_info(info: &(dyn Any + Send + 'static)) -> anyhow::Error {
    if let Some(message) = info.downcast_ref::<&'static str>() {
        anyhow!("sender panicked: {message}")
    } else if let Some(message) = info.downcast_ref::<String>() {
        anyhow!("sender panicked: {message}")
    } else {
        anyhow!("sender panicked")
    }
}

/// Run `callback` inside a Sentry performance transaction.
///
/// Without a bound Sentry client this is a plain call.
pub(crate) async fn with_sentry_transaction<F, Fut, R, E>(
    transaction_name: &str,
    callback: F,
) -> Result<R, E>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<R, E>>,
{
    let tx_ctx = sentry_core::TransactionContext::new(transaction_name, "campaign.dispatch");
    let tx = sentry_core::start_transaction(tx_ctx);

    let result = sentry_core::with_scope(|scope| scope.set_span(Some(tx.clone().into())), callback)
        .await;

    tx.set_status(match result.is_ok() {
        true => SpanStatus::Ok,
        false => SpanStatus::UnknownError,
    });
    tx.finish();

    result
}
