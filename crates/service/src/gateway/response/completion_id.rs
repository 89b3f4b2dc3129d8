use rand::Rng;

const ID_EPOCH: i64 = 1_567_879_599;
const ALPHABET: &[u8; 62] = b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
const TIMESTAMP_WIDTH: usize = 5;
const RANDOM_SUFFIX_LEN: usize = 24;
const ID_PREFIX: &str = "chatcmpl-";

/// Fixed-width base-62 rendering of `created - ID_EPOCH`, most significant digit first.
///
/// Each digit is shifted down by one symbol, so a zero digit wraps to the last
/// alphabet entry instead of indexing before the start.
pub(crate) fn encode_timestamp(created: i64) -> String {
    let base = ALPHABET.len() as i64;
    let mut value = created - ID_EPOCH;
    let mut digits = [0u8; TIMESTAMP_WIDTH];
    for slot in digits.iter_mut().rev() {
        let index = value.rem_euclid(base) as usize;
        *slot = ALPHABET[(index + ALPHABET.len() - 1) % ALPHABET.len()];
        value = value.div_euclid(base);
    }
    digits.iter().map(|byte| *byte as char).collect()
}

/// Cosmetic completion id in the upstream `chatcmpl-` shape. Not unique by construction.
pub(crate) fn generate_completion_id<R: Rng + ?Sized>(created: i64, rng: &mut R) -> String {
    let mut id = String::with_capacity(ID_PREFIX.len() + TIMESTAMP_WIDTH + RANDOM_SUFFIX_LEN);
    id.push_str(ID_PREFIX);
    id.push_str(&encode_timestamp(created));
    for _ in 0..RANDOM_SUFFIX_LEN {
        id.push(ALPHABET[rng.gen_range(0..ALPHABET.len())] as char);
    }
    id
}
