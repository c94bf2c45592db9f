use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::error::ChatError;
use crate::session::Session;

/// Sends `message` as the next user turn of `session` and reads the reply to
/// the end.
///
/// `on_increment` receives the cumulative reply after every non-empty
/// fragment, so each argument extends the previous one. The returned string is
/// the full reply. Any failure fails the whole call; text already handed to
/// `on_increment` is the caller's to keep or drop. The exchange is added to the
/// session history only on success with a non-empty reply; the API rejects
/// empty model parts, so an empty exchange would poison every later request.
pub async fn send_and_stream<F>(
    session: &mut Session,
    message: &str,
    cancel: &CancellationToken,
    mut on_increment: F,
) -> Result<String, ChatError>
where
    F: FnMut(&str),
{
    let mut fragments = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(ChatError::Cancelled),
        opened = session.open_stream(message) => opened?,
    };

    let mut cumulative = String::new();
    let mut received = 0usize;
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::info!(session = %session.id(), received, "stream cancelled");
                return Err(ChatError::Cancelled);
            }
            next = fragments.next() => next,
        };

        match next {
            Some(Ok(fragment)) => {
                if fragment.is_empty() {
                    continue;
                }
                received += 1;
                cumulative.push_str(&fragment);
                on_increment(&cumulative);
            }
            Some(Err(err)) => {
                tracing::warn!(session = %session.id(), received, error = %err, "stream failed");
                return Err(err);
            }
            None => break,
        }
    }

    tracing::debug!(
        session = %session.id(),
        fragments = received,
        chars = cumulative.chars().count(),
        "stream complete"
    );
    if cumulative.is_empty() {
        tracing::info!(session = %session.id(), "empty reply left out of history");
    } else {
        session.record_exchange(message, &cumulative);
    }
    Ok(cumulative)
}
