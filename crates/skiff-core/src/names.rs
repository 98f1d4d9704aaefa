//! Generated container names for requests that omit one.

use rand::Rng;

const ADJECTIVES: &[&str] = &[
    "amber", "bold", "calm", "deft", "eager", "fond", "glad", "keen", "lucid", "mild",
    "noble", "quick", "sly", "tidy", "vivid", "warm",
];

const SURNAMES: &[&str] = &[
    "ampere", "bohr", "curie", "darwin", "euler", "fermi", "gauss", "hopper", "kepler",
    "lovelace", "maxwell", "noether", "pascal", "ritchie", "turing", "wozniak",
];

/// Produces an `adjective_surname` name with a short random suffix so
/// repeated draws are unlikely to collide before the cache check runs.
#[must_use]
pub fn generate_name() -> String {
    let mut rng = rand::thread_rng();
    let adjective = ADJECTIVES[rng.gen_range(0..ADJECTIVES.len())];
    let surname = SURNAMES[rng.gen_range(0..SURNAMES.len())];
    let suffix: u16 = rng.gen_range(0..1000);
    format!("{adjective}_{surname}{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_names_are_well_formed() {
        let name = generate_name();
        let (adjective, rest) = name.split_once('_').unwrap();
        assert!(ADJECTIVES.contains(&adjective));
        assert!(SURNAMES.iter().any(|s| rest.starts_with(s)));
    }
}
