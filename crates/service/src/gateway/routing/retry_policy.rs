/// Decides whether a failed attempt may move on to another channel.
///
/// Pinned requests and locally produced failures are never retried. 429 and 307
/// always are; gateway timeouts (504, 524) are not because the upstream may still be
/// working on the request.
pub(crate) fn should_retry(status: u16, local: bool, pinned: bool) -> bool {
    if pinned || local {
        return false;
    }
    match status {
        429 | 307 => true,
        504 | 524 => false,
        500..=599 => true,
        400 | 408 => false,
        200..=299 => false,
        _ => true,
    }
}
