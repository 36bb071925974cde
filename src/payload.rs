//! Synthetic listing-style test messages.
//!
//! Every message has the same MarkdownV2 shape with randomized numbers, so
//! its size stays within [`MAX_MESSAGE_BYTES`]. Reserved MarkdownV2
//! characters are escaped here; the client sends the text as-is.

use rand::Rng;

/// Upper bound on the UTF-8 size of a generated message.
pub const MAX_MESSAGE_BYTES: usize = 160;

/// Builds one randomized test message.
pub fn generate_message<R: Rng + ?Sized>(rng: &mut R) -> String {
    let model = rng.gen_range(0..20);
    let storage = rng.gen_range(0..512);
    let thousands = rng.gen_range(0..30);
    let hundreds = rng.gen_range(100..999);
    let listing = rng.gen_range(10_000..48_000);
    format!(
        "*iPhone {}, {} GB*\n💵 *{} {}  ₽*  ⭐️ *0\\.0* *\\(0\\)*\nhttps://www\\.avito\\.ru/79051{}",
        model, storage, thousands, hundreds, listing
    )
}

/// Uses the thread-local generator.
pub fn random_message() -> String {
    generate_message(&mut rand::thread_rng())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn messages_are_bounded() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..1000 {
            let msg = generate_message(&mut rng);
            assert!(!msg.is_empty());
            assert!(msg.len() <= MAX_MESSAGE_BYTES, "{} bytes: {}", msg.len(), msg);
        }
    }

    #[test]
    fn reserved_characters_are_escaped() {
        let msg = random_message();
        for reserved in ['.', '(', ')'] {
            for (i, c) in msg.char_indices() {
                if c == reserved {
                    assert_eq!(&msg[i - 1..i], "\\", "unescaped '{}' in {}", c, msg);
                }
            }
        }
    }

    #[test]
    fn same_seed_same_message() {
        let a = generate_message(&mut StdRng::seed_from_u64(42));
        let b = generate_message(&mut StdRng::seed_from_u64(42));
        assert_eq!(a, b);
    }
}
