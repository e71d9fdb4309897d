//! One-time passcodes for password resets.
//!
//! A code is 7 characters: 3 uppercase letters and 4 digits in random
//! order, never with 3 letters in a row, and with at least 4 distinct
//! characters.

use rand::seq::SliceRandom;
use rand::Rng;

const LETTERS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const DIGITS: &[u8] = b"0123456789";

pub const OTP_LEN: usize = 7;

fn has_letter_run(code: &str, run: usize) -> bool {
    let mut streak = 0;
    for c in code.chars() {
        if c.is_ascii_alphabetic() {
            streak += 1;
            if streak >= run {
                return true;
            }
        } else {
            streak = 0;
        }
    }
    false
}

fn distinct_chars(code: &str) -> usize {
    let mut seen: Vec<char> = code.chars().collect();
    seen.sort_unstable();
    seen.dedup();
    seen.len()
}

pub fn generate() -> String {
    let mut rng = rand::thread_rng();
    loop {
        let mut chars: Vec<u8> = Vec::with_capacity(OTP_LEN);
        for _ in 0..3 {
            chars.push(LETTERS[rng.gen_range(0..LETTERS.len())]);
        }
        for _ in 0..4 {
            chars.push(DIGITS[rng.gen_range(0..DIGITS.len())]);
        }
        chars.shuffle(&mut rng);
        let code: String = chars.into_iter().map(char::from).collect();
        if has_letter_run(&code, 3) || distinct_chars(&code) < 4 {
            continue;
        }
        return code;
    }
}

/// Shape check only; whether a code matches a token is checked by the
/// caller.
pub fn is_well_formed(code: &str) -> bool {
    if code.chars().count() != OTP_LEN {
        return false;
    }
    let letters = code.chars().filter(|c| c.is_ascii_alphabetic()).count();
    let digits = code.chars().filter(|c| c.is_ascii_digit()).count();
    letters == 3 && digits == 4 && !has_letter_run(code, 3)
}
