//! Next-code suggestion for items and equipment.

/// Suggest the code following the highest numbered code that starts with `prefix`.
///
/// The numeric part is made of the digits found after the prefix; codes without digits count
/// as zero and codes whose number does not fit a `u64` are ignored. The result is zero-padded to `pad` digits. Matching is case-insensitive and the
/// suggestion uses the upper-cased prefix.
pub fn suggest_next_code<'a>(prefix: &str, codes: impl IntoIterator<Item = &'a str>, pad: usize) -> String {
    let prefix = prefix.trim().to_uppercase();

    let max = codes
        .into_iter()
        .filter_map(|code| {
            let code = code.trim().to_uppercase();
            let tail = code.strip_prefix(prefix.as_str())?;
            let digits: String = tail.chars().filter(char::is_ascii_digit).collect();
            if digits.is_empty() {
                return Some(0);
            }
            digits.parse::<u64>().ok()
        })
        .max()
        .unwrap_or(0);

    format!("{prefix}{:0pad$}", max.saturating_add(1), pad = pad)
}
