// exchange/wallet.rs
// ====
// EIP-712 wallet for action-signed venues (HyperLiquid)
// ====
// Typed-data signing over secp256k1 with no external wallet libraries.
// Actions are hashed as keccak256(msgpack(action) ‖ nonce ‖ vault marker
// [‖ expiry marker ‖ expiry]) and signed as an Agent struct.
// ====

use k256::ecdsa::signature::hazmat::PrehashSigner;
use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use k256::SecretKey;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha3::{Digest, Keccak256};

use super::errors::ExchangeError;

/// Signature in the (r, s, v) form action-signed venues expect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature712 {
    pub r: String,
    pub s: String,
    pub v: u8,
}

pub struct Wallet {
    signing_key: SigningKey,
    /// Public address (0x...)
    pub address: String,
}

impl Wallet {
    /// Create wallet from private key hex string ("0x" prefix optional).
    pub fn from_private_key(private_key_hex: &str) -> Result<Self, ExchangeError> {
        let key_hex = private_key_hex.trim_start_matches("0x");
        let key_bytes = hex::decode(key_hex)
            .map_err(|e| ExchangeError::Signing(format!("invalid private key hex: {}", e)))?;
        let secret_key = SecretKey::from_slice(&key_bytes)
            .map_err(|e| ExchangeError::Signing(format!("invalid private key: {}", e)))?;
        let signing_key = SigningKey::from(secret_key);
        let address = Self::derive_address(&signing_key);

        Ok(Self {
            signing_key,
            address,
        })
    }

    /// Derive Ethereum address from signing key
    fn derive_address(signing_key: &SigningKey) -> String {
        let verifying_key = signing_key.verifying_key();
        let public_key_bytes = verifying_key.to_encoded_point(false);
        let public_key_bytes = public_key_bytes.as_bytes();

        // Skip the 0x04 prefix of the uncompressed key, keccak the rest,
        // keep the last 20 bytes.
        let hash = keccak256(&public_key_bytes[1..]);
        format!("0x{}", hex::encode(&hash[12..]))
    }

    /// Sign EIP-712 typed data. Deterministic (RFC 6979): identical inputs
    /// yield byte-identical (r, s, v).
    pub fn sign_typed_data(&self, typed_data: &TypedData) -> Result<Signature712, ExchangeError> {
        let digest = typed_data.encode()?;
        self.sign_digest(&digest)
    }

    /// Signs the agent struct carrying an action hash, the signature every
    /// exchange action payload requires.
    pub fn sign_action(
        &self,
        connection_id: [u8; 32],
        is_testnet: bool,
    ) -> Result<Signature712, ExchangeError> {
        let typed_data = agent_typed_data(connection_id, is_testnet);
        self.sign_typed_data(&typed_data)
    }

    fn sign_digest(&self, digest: &[u8; 32]) -> Result<Signature712, ExchangeError> {
        let signature: Signature = self
            .signing_key
            .sign_prehash(digest)
            .map_err(|e| ExchangeError::Signing(e.to_string()))?;
        let signature = signature.normalize_s().unwrap_or(signature);

        // Recover v (27/28) by trial recovery against our own public key.
        let own_key = self.signing_key.verifying_key();
        let mut v = None;
        for candidate in [0u8, 1u8] {
            let Some(recovery_id) = RecoveryId::from_byte(candidate) else {
                continue;
            };
            if let Ok(recovered) = VerifyingKey::recover_from_prehash(digest, &signature, recovery_id)
            {
                if recovered == *own_key {
                    v = Some(27 + candidate);
                    break;
                }
            }
        }
        let v = v.ok_or_else(|| {
            ExchangeError::Signing("no recovery id reproduces the signing key".to_string())
        })?;

        let bytes = signature.to_bytes();
        Ok(Signature712 {
            r: format!("0x{}", hex::encode(&bytes[..32])),
            s: format!("0x{}", hex::encode(&bytes[32..64])),
            v,
        })
    }
}

/// Action hash: keccak256 over the msgpack-encoded action, the big-endian
/// nonce, a vault marker byte (0x01 + address bytes when present), and an
/// optional expiry marker.
pub fn action_hash<T: Serialize>(
    action: &T,
    vault_address: Option<&str>,
    nonce: u64,
    expires_after: Option<u64>,
) -> Result<[u8; 32], ExchangeError> {
    let mut bytes = rmp_serde::to_vec_named(action)
        .map_err(|e| ExchangeError::Signing(format!("msgpack encode failed: {}", e)))?;
    bytes.extend_from_slice(&nonce.to_be_bytes());
    match vault_address {
        Some(address) => {
            bytes.push(1);
            let address = hex::decode(address.trim_start_matches("0x"))
                .map_err(|e| ExchangeError::Signing(format!("invalid vault address: {}", e)))?;
            bytes.extend_from_slice(&address);
        }
        None => bytes.push(0),
    }
    if let Some(expires) = expires_after {
        bytes.push(0);
        bytes.extend_from_slice(&expires.to_be_bytes());
    }
    Ok(keccak256(&bytes))
}

/// The Agent struct signed for every action. `source` distinguishes
/// mainnet ("a") from testnet ("b").
pub fn agent_typed_data(connection_id: [u8; 32], is_testnet: bool) -> TypedData {
    TypedData {
        domain: EIP712Domain {
            name: "Exchange".to_string(),
            version: "1".to_string(),
            chain_id: 1337,
            verifying_contract: "0x0000000000000000000000000000000000000000".to_string(),
        },
        primary_type: "Agent".to_string(),
        types: json!({
            "Agent": [
                { "name": "source", "type": "string" },
                { "name": "connectionId", "type": "bytes32" }
            ]
        }),
        message: json!({
            "source": if is_testnet { "b" } else { "a" },
            "connectionId": format!("0x{}", hex::encode(connection_id)),
        }),
    }
}

/// EIP-712 Domain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EIP712Domain {
    pub name: String,
    pub version: String,
    #[serde(rename = "chainId")]
    pub chain_id: u64,
    #[serde(rename = "verifyingContract")]
    pub verifying_contract: String,
}

/// EIP-712 Typed Data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypedData {
    pub domain: EIP712Domain,
    #[serde(rename = "primaryType")]
    pub primary_type: String,
    pub types: Value,
    pub message: Value,
}

impl TypedData {
    /// Encode typed data for signing (EIP-712)
    ///
    /// Returns: keccak256("\x19\x01" ‖ domainSeparator ‖ hashStruct(message))
    pub fn encode(&self) -> Result<[u8; 32], ExchangeError> {
        let domain_separator = self.hash_domain()?;
        let message_hash = self.hash_struct(&self.primary_type, &self.message)?;

        let mut encoded = Vec::with_capacity(66);
        encoded.push(0x19);
        encoded.push(0x01);
        encoded.extend_from_slice(&domain_separator);
        encoded.extend_from_slice(&message_hash);

        Ok(keccak256(&encoded))
    }

    fn hash_domain(&self) -> Result<[u8; 32], ExchangeError> {
        let type_hash = keccak256(
            b"EIP712Domain(string name,string version,uint256 chainId,address verifyingContract)",
        );
        let name_hash = keccak256(self.domain.name.as_bytes());
        let version_hash = keccak256(self.domain.version.as_bytes());
        let contract_bytes = hex::decode(self.domain.verifying_contract.trim_start_matches("0x"))
            .map_err(|e| ExchangeError::Signing(format!("invalid verifying contract: {}", e)))?;

        let mut encoded = Vec::new();
        encoded.extend_from_slice(&type_hash);
        encoded.extend_from_slice(&name_hash);
        encoded.extend_from_slice(&version_hash);

        let mut chain_id_padded = [0u8; 32];
        chain_id_padded[24..].copy_from_slice(&self.domain.chain_id.to_be_bytes());
        encoded.extend_from_slice(&chain_id_padded);

        let mut contract_padded = [0u8; 32];
        contract_padded[12..].copy_from_slice(&contract_bytes);
        encoded.extend_from_slice(&contract_padded);

        Ok(keccak256(&encoded))
    }

    fn hash_struct(&self, struct_type: &str, data: &Value) -> Result<[u8; 32], ExchangeError> {
        let type_def = self
            .types
            .get(struct_type)
            .ok_or_else(|| ExchangeError::Signing(format!("type {} not found", struct_type)))?;

        let type_string = encode_type(struct_type, type_def)?;
        let type_hash = keccak256(type_string.as_bytes());

        let mut encoded = Vec::new();
        encoded.extend_from_slice(&type_hash);

        if let Some(fields) = type_def.as_array() {
            for field in fields {
                let field_name = field["name"]
                    .as_str()
                    .ok_or_else(|| ExchangeError::Signing("field name missing".to_string()))?;
                let field_type = field["type"]
                    .as_str()
                    .ok_or_else(|| ExchangeError::Signing("field type missing".to_string()))?;
                let field_encoded = encode_field(field_type, &data[field_name])?;
                encoded.extend_from_slice(&field_encoded);
            }
        }

        Ok(keccak256(&encoded))
    }
}

fn encode_type(struct_type: &str, type_def: &Value) -> Result<String, ExchangeError> {
    let mut type_string = format!("{}(", struct_type);
    if let Some(fields) = type_def.as_array() {
        let field_strings: Vec<String> = fields
            .iter()
            .map(|field| {
                let field_type = field["type"].as_str().unwrap_or("");
                let field_name = field["name"].as_str().unwrap_or("");
                format!("{} {}", field_type, field_name)
            })
            .collect();
        type_string.push_str(&field_strings.join(","));
    }
    type_string.push(')');
    Ok(type_string)
}

fn encode_field(field_type: &str, value: &Value) -> Result<[u8; 32], ExchangeError> {
    match field_type {
        "string" => {
            let s = value
                .as_str()
                .ok_or_else(|| ExchangeError::Signing("expected string".to_string()))?;
            Ok(keccak256(s.as_bytes()))
        }
        "bytes32" => {
            let s = value
                .as_str()
                .ok_or_else(|| ExchangeError::Signing("expected bytes32 hex".to_string()))?;
            let raw = hex::decode(s.trim_start_matches("0x"))
                .map_err(|e| ExchangeError::Signing(format!("invalid bytes32: {}", e)))?;
            if raw.len() != 32 {
                return Err(ExchangeError::Signing(format!(
                    "bytes32 must be 32 bytes, got {}",
                    raw.len()
                )));
            }
            let mut bytes = [0u8; 32];
            bytes.copy_from_slice(&raw);
            Ok(bytes)
        }
        "uint256" | "uint64" | "uint32" | "uint8" => {
            let n = value
                .as_u64()
                .ok_or_else(|| ExchangeError::Signing("expected number".to_string()))?;
            let mut bytes = [0u8; 32];
            bytes[24..].copy_from_slice(&n.to_be_bytes());
            Ok(bytes)
        }
        "address" => {
            let addr = value
                .as_str()
                .ok_or_else(|| ExchangeError::Signing("expected address".to_string()))?;
            let addr_bytes = hex::decode(addr.trim_start_matches("0x"))
                .map_err(|e| ExchangeError::Signing(format!("invalid address: {}", e)))?;
            let mut bytes = [0u8; 32];
            bytes[12..].copy_from_slice(&addr_bytes);
            Ok(bytes)
        }
        "bool" => {
            let b = value
                .as_bool()
                .ok_or_else(|| ExchangeError::Signing("expected bool".to_string()))?;
            let mut bytes = [0u8; 32];
            bytes[31] = u8::from(b);
            Ok(bytes)
        }
        _ => Err(ExchangeError::Signing(format!(
            "unsupported field type: {}",
            field_type
        ))),
    }
}

/// Helper: Keccak256 hash
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    let result = hasher.finalize();
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&result);
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    // Test private key (DO NOT USE IN PRODUCTION)
    const TEST_KEY: &str = "0x1234567890abcdef1234567890abcdef1234567890abcdef1234567890abcdef";

    #[test]
    fn test_wallet_creation() {
        let wallet = Wallet::from_private_key(TEST_KEY).unwrap();
        assert!(wallet.address.starts_with("0x"));
        assert_eq!(wallet.address.len(), 42); // 0x + 40 hex chars
    }

    #[test]
    fn test_known_address_derivation() {
        // Private key 0x...01 has a well-known address.
        let wallet = Wallet::from_private_key(
            "0x0000000000000000000000000000000000000000000000000000000000000001",
        )
        .unwrap();
        assert_eq!(
            wallet.address.to_lowercase(),
            "0x7e5f4552091a69125d5dfcb7b8c2659029395bdf"
        );
    }

    #[test]
    fn test_signing_is_deterministic() {
        let wallet = Wallet::from_private_key(TEST_KEY).unwrap();
        let hash = action_hash(&serde_json::json!({"type": "cancel"}), None, 42, None).unwrap();
        let first = wallet.sign_action(hash, false).unwrap();
        let second = wallet.sign_action(hash, false).unwrap();
        assert_eq!(first, second);
        assert!(first.v == 27 || first.v == 28);
        assert_eq!(first.r.len(), 66);
        assert_eq!(first.s.len(), 66);
    }

    #[test]
    fn test_action_hash_sensitivity() {
        let action = serde_json::json!({"type": "order"});
        let base = action_hash(&action, None, 1, None).unwrap();
        assert_ne!(base, action_hash(&action, None, 2, None).unwrap());
        assert_ne!(
            base,
            action_hash(&action, Some("0x7e5f4552091a69125d5dfcb7b8c2659029395bdf"), 1, None)
                .unwrap()
        );
        assert_ne!(base, action_hash(&action, None, 1, Some(9)).unwrap());
    }

    #[test]
    fn test_testnet_source_changes_signature() {
        let wallet = Wallet::from_private_key(TEST_KEY).unwrap();
        let hash = action_hash(&serde_json::json!({"type": "order"}), None, 7, None).unwrap();
        let mainnet = wallet.sign_action(hash, false).unwrap();
        let testnet = wallet.sign_action(hash, true).unwrap();
        assert_ne!(mainnet, testnet);
    }
}
