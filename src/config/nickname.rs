//! Default bot nickname.
//!
//! `Dcc` followed by a short noun and two digits (e.g. `DccOwl07`), kept
//! within the common 9-character nickname limit.

use rand::RngExt;

const NOUNS: &[&str] = &[
    "Fox", "Owl", "Elk", "Yak", "Emu", "Koi", "Ray", "Bat", "Eel", "Ant", "Cod", "Jay", "Gnu",
    "Pug", "Ram", "Hen",
];

pub fn generate_nickname() -> String {
    let mut rng = rand::rng();
    let noun = NOUNS[rng.random_range(0..NOUNS.len())];
    let num: u8 = rng.random_range(0..100);
    format!("Dcc{}{:02}", noun, num)
}
