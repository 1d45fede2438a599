use crate::config::BankAccount;

const TOPUP_TAG: &str = "TOPUP-";
const ORDER_TAG: &str = "ORDER-";
const TOPUP_MIN_ID_LEN: usize = 10;

/// Smallest amount the QR generator is asked to encode.
pub const MIN_QR_AMOUNT: i64 = 10_000;

/// What a bank transfer description refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferReference {
    Topup(String),
    Order(String),
    Unrecognized,
}

/// Classify a transfer description. Top-up references win over order
/// references when both are present.
pub fn parse_reference(description: &str) -> TransferReference {
    if let Some(user_id) = find_tagged_id(description, TOPUP_TAG, TOPUP_MIN_ID_LEN) {
        return TransferReference::Topup(user_id);
    }
    if let Some(order_id) = find_tagged_id(description, ORDER_TAG, 1) {
        return TransferReference::Order(order_id);
    }
    TransferReference::Unrecognized
}

pub fn topup_reference(user_id: &str) -> String {
    format!("{}{}", TOPUP_TAG, user_id)
}

pub fn order_reference(order_id: &str) -> String {
    format!("{}{}", ORDER_TAG, order_id)
}

fn is_id_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'-'
}

/// First `<tag><id>` occurrence (tag matched case-insensitively) whose id is
/// at least `min_len` bytes of `[A-Za-z0-9_-]`.
fn find_tagged_id(text: &str, tag: &str, min_len: usize) -> Option<String> {
    let bytes = text.as_bytes();
    let tag = tag.as_bytes();
    if bytes.len() < tag.len() {
        return None;
    }

    for start in 0..=bytes.len() - tag.len() {
        if !bytes[start..start + tag.len()].eq_ignore_ascii_case(tag) {
            continue;
        }
        let id_start = start + tag.len();
        let id_len = bytes[id_start..].iter().take_while(|b| is_id_byte(**b)).count();
        if id_len >= min_len {
            // Tag and id are ASCII, so both ends sit on char boundaries.
            return Some(text[id_start..id_start + id_len].to_string());
        }
    }
    None
}

/// VietQR image URL asking the payer to transfer `amount` with `add_info` as
/// the transfer description.
pub fn qr_url(bank: &BankAccount, amount: i64, add_info: &str) -> String {
    let mut url = format!(
        "https://img.vietqr.io/image/{}-{}-{}.png?amount={}",
        bank.bank_code,
        bank.account_number,
        bank.template,
        amount.max(MIN_QR_AMOUNT)
    );
    if !add_info.is_empty() {
        url.push_str("&addInfo=");
        url.push_str(&encode_query_value(add_info));
    }
    if !bank.account_name.is_empty() {
        url.push_str("&accountName=");
        url.push_str(&encode_query_value(&bank.account_name));
    }
    url
}

fn encode_query_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for b in value.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'*' => out.push(b as char),
            b' ' => out.push('+'),
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}
