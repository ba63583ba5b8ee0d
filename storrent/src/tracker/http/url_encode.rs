/// Percent-encodes a hex string two nibbles at a time, the form trackers
/// expect the info-hash in: "2c6b..." becomes "%2c%6b...".
pub fn encode(hex_string: &str) -> String {
    if hex_string.is_empty() {
        return hex_string.to_string();
    }
    let mut encoded = hex_string
        .chars()
        .collect::<Vec<char>>()
        .chunks(2)
        .map(|pair| pair.iter().collect::<String>())
        .collect::<Vec<String>>()
        .join("%");
    encoded.insert(0, '%');
    encoded
}
