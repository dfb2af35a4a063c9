use anyhow::{bail, Context, Result};

/// Parse a hex string into bytes
/// Accepts the spellings people paste from card logs:
/// - "A0A40000027F10" (packed)
/// - "A0 A4 00 00" (space-separated, as the exchange log renders them)
/// - "0xA0,0xA4" (0x prefix with commas)
/// - "A0:A4" or "A0-A4"
pub fn parse_hex(hex_str: &str) -> Result<Vec<u8>> {
    let cleaned = strip_separators(hex_str);

    if cleaned.is_empty() {
        return Ok(Vec::new());
    }

    if cleaned.len() % 2 != 0 {
        bail!(
            "Hex string must have even number of characters: '{}'",
            hex_str
        );
    }

    hex::decode(&cleaned).with_context(|| format!("Invalid hex string: '{hex_str}'"))
}

fn strip_separators(hex_str: &str) -> String {
    hex_str
        .trim()
        .replace("0x", "")
        .replace("0X", "")
        .chars()
        .filter(|c| !matches!(c, ' ' | ',' | ':' | '-' | '\t' | '\n' | '\r'))
        .collect()
}

/// Format bytes as packed uppercase hex
pub fn format_hex(bytes: &[u8]) -> String {
    hex::encode_upper(bytes)
}

/// Format bytes as uppercase hex pairs separated by spaces ("A0 A4 00 00")
pub fn format_hex_spaced(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Format bytes as ASCII, replacing non-printable chars with '.'
pub fn format_ascii(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&b| {
            if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            }
        })
        .collect()
}

/// Format bytes as a 16-column hex dump with an ASCII gutter
pub fn format_hex_dump(bytes: &[u8]) -> String {
    const BYTES_PER_LINE: usize = 16;

    if bytes.is_empty() {
        return String::from("(empty)");
    }

    bytes
        .chunks(BYTES_PER_LINE)
        .enumerate()
        .map(|(i, chunk)| {
            let hex = format_hex_spaced(chunk);
            format!(
                "{:04X}: {:<width$} |{}|",
                i * BYTES_PER_LINE,
                hex,
                format_ascii(chunk),
                width = BYTES_PER_LINE * 3 - 1
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Describe a status word the way a SIM (GSM 11.11) or ISO 7816-4 card means it.
///
/// Class `A0` SIM commands answer with `9F xx` rather than the ISO `61 xx`
/// when response data is waiting, so both families are covered.
pub fn describe_status_word(sw1: u8, sw2: u8) -> String {
    match (sw1, sw2) {
        (0x90, 0x00) => "Success".to_string(),
        (0x91, n) => format!("Success, proactive command of {n} bytes pending"),
        (0x9F, n) => format!("Success, {n} bytes of response data available"),
        (0x61, n) => format!("Success, {n} bytes available"),
        (0x92, n) if n & 0xF0 == 0x00 => {
            format!("Success after {} internal retries", n & 0x0F)
        }
        (0x92, 0x40) => "Error: Memory problem".to_string(),
        (0x93, 0x00) => "Error: SIM application toolkit busy".to_string(),
        (0x94, 0x00) => "Error: No EF selected".to_string(),
        (0x94, 0x02) => "Error: Out of range (invalid address)".to_string(),
        (0x94, 0x04) => "Error: File ID not found".to_string(),
        (0x94, 0x08) => "Error: File inconsistent with the command".to_string(),
        (0x98, 0x02) => "Error: No CHV initialised".to_string(),
        (0x98, 0x04) => "Error: Access condition not fulfilled".to_string(),
        (0x98, 0x08) => "Error: In contradiction with CHV status".to_string(),
        (0x98, 0x10) => "Error: In contradiction with invalidation status".to_string(),
        (0x98, 0x40) => "Error: CHV blocked".to_string(),
        (0x98, 0x50) => "Error: Increase cannot be performed, max value reached".to_string(),
        (0x62, 0x82) => "Warning: End of file reached".to_string(),
        (0x63, n) if n & 0xF0 == 0xC0 => format!("Warning: Counter = {}", n & 0x0F),
        (0x67, _) => "Error: Wrong length".to_string(),
        (0x69, 0x82) => "Error: Security status not satisfied".to_string(),
        (0x6A, 0x82) => "Error: File not found".to_string(),
        (0x6A, 0x83) => "Error: Record not found".to_string(),
        (0x6B, _) => "Error: Wrong parameter(s) P1-P2".to_string(),
        (0x6C, n) => format!("Error: Wrong Le field, exact length: {n}"),
        (0x6D, _) => "Error: Instruction code not supported or invalid".to_string(),
        (0x6E, _) => "Error: Class not supported".to_string(),
        (0x6F, _) => "Error: No precise diagnosis".to_string(),
        _ => format!("Unknown status: {sw1:02X} {sw2:02X}"),
    }
}
