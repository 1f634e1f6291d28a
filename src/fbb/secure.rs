//! Secure login challenge/response.

use md5::{Digest, Md5};

// This salt was found in paclink-unix's source code.
const SECURE_LOGIN_SALT: [u8; 64] = [
    77, 197, 101, 206, 190, 249, 93, 200, 51, 243, 93, 237, 71, 94, 239, 138, 68, 108, 70, 185,
    225, 137, 217, 16, 51, 122, 193, 48, 194, 195, 198, 175, 172, 169, 70, 84, 61, 62, 104, 186,
    114, 52, 61, 168, 66, 129, 192, 208, 187, 249, 232, 193, 41, 113, 41, 45, 240, 16, 29, 228,
    208, 228, 61, 20,
];

/// Computes the response token for a `;PQ:` secure login challenge.
///
/// This is a port of the legacy paclink-unix algorithm. The digest-byte
/// packing looks odd, but must stay bit-exact for interoperability with the
/// deployed network.
pub fn secure_login_response(challenge: &str, password: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(format!("{}{}", challenge, password).to_uppercase().as_bytes());
    hasher.update(SECURE_LOGIN_SALT);
    let sum = hasher.finalize();

    let mut pr = i32::from(sum[3] & 0x3f);
    for i in (0..=2).rev() {
        pr = (pr << 8) | i32::from(sum[i]);
    }

    let digits = format!("{:08}", pr);
    digits[digits.len() - 8..].to_string()
}
