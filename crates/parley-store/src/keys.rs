use parley_shared::types::now_ms;
use rusqlite::{params, OptionalExtension};

use crate::database::Database;
use crate::error::{Result, StoreError};

impl Database {
    /// Persist the identity seed for `address`, replacing any previous one.
    pub fn store_key_material(&self, address: &str, seed: &[u8; 32]) -> Result<()> {
        self.conn().execute(
            "INSERT INTO key_material (address, seed_hex, created_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(address) DO UPDATE SET seed_hex = excluded.seed_hex",
            params![address.to_lowercase(), hex::encode(seed), now_ms()],
        )?;
        Ok(())
    }

    pub fn load_key_material(&self, address: &str) -> Result<Option<[u8; 32]>> {
        let address = address.to_lowercase();
        let seed_hex: Option<String> = self
            .conn()
            .query_row(
                "SELECT seed_hex FROM key_material WHERE address = ?1",
                params![address],
                |row| row.get(0),
            )
            .optional()?;

        let Some(seed_hex) = seed_hex else {
            return Ok(None);
        };

        let seed: [u8; 32] = hex::decode(&seed_hex)
            .ok()
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or_else(|| StoreError::InvalidKeyMaterial(address.clone()))?;
        Ok(Some(seed))
    }
}
