//! services/client/src/adapters/auth.rs
//!
//! Password accounts stored in PostgreSQL. Hashes are argon2 PHC strings. The signed-in
//! identity is per process and observable through `on_auth_state_change`.

use crate::adapters::db::port_error;
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use async_trait::async_trait;
use futures::stream;
use sqlx::{FromRow, PgPool};
use study_sync_core::domain::Identity;
use study_sync_core::ports::{AuthService, AuthStateStream, PortError, PortResult};
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(FromRow)]
struct AccountRecord {
    id: Uuid,
    email: String,
    password_hash: String,
}

pub struct PgAuth {
    pool: PgPool,
    current: watch::Sender<Option<Identity>>,
}

impl PgAuth {
    pub fn new(pool: PgPool) -> Self {
        let (current, _) = watch::channel(None);
        Self { pool, current }
    }
}

fn hash_password(password: &str) -> PortResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| {
            error!("Failed to hash password: {:?}", e);
            PortError::Unexpected("Failed to hash password".to_string())
        })
}

fn verify_password(password: &str, stored: &str) -> bool {
    match PasswordHash::new(stored) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(e) => {
            warn!("Stored password hash is unreadable: {:?}", e);
            false
        }
    }
}

fn validate_credentials(email: &str, password: &str) -> PortResult<()> {
    if !email.contains('@') {
        return Err(PortError::Conflict("A valid email address is required".to_string()));
    }
    if password.len() < 6 {
        return Err(PortError::Conflict(
            "Password must be at least 6 characters".to_string(),
        ));
    }
    Ok(())
}

#[async_trait]
impl AuthService for PgAuth {
    async fn sign_up(&self, email: &str, password: &str) -> PortResult<Identity> {
        validate_credentials(email, password)?;
        let password_hash = hash_password(password)?;
        let record = sqlx::query_as::<_, AccountRecord>(
            "INSERT INTO accounts (id, email, password_hash) VALUES ($1, $2, $3)
             RETURNING id, email, password_hash",
        )
        .bind(Uuid::new_v4())
        .bind(email.to_lowercase())
        .bind(password_hash)
        .fetch_one(&self.pool)
        .await
        .map_err(port_error)?;

        let identity = Identity {
            id: record.id,
            email: Some(record.email),
        };
        info!(account = %identity.id, "Account created.");
        self.current.send_replace(Some(identity.clone()));
        Ok(identity)
    }

    async fn sign_in(&self, email: &str, password: &str) -> PortResult<Identity> {
        let record = sqlx::query_as::<_, AccountRecord>(
            "SELECT id, email, password_hash FROM accounts WHERE email = $1",
        )
        .bind(email.to_lowercase())
        .fetch_optional(&self.pool)
        .await
        .map_err(port_error)?
        .ok_or(PortError::Unauthorized)?;

        if !verify_password(password, &record.password_hash) {
            return Err(PortError::Unauthorized);
        }
        let identity = Identity {
            id: record.id,
            email: Some(record.email),
        };
        info!(account = %identity.id, "Signed in.");
        self.current.send_replace(Some(identity.clone()));
        Ok(identity)
    }

    async fn sign_out(&self) -> PortResult<()> {
        self.current.send_replace(None);
        Ok(())
    }

    /// Records a reset token. Delivery is out of band; the token is logged for operators.
    async fn reset_password(&self, email: &str) -> PortResult<()> {
        let token = Uuid::new_v4();
        let result = sqlx::query(
            "INSERT INTO password_resets (token, account_id)
             SELECT $1, id FROM accounts WHERE email = $2",
        )
        .bind(token)
        .bind(email.to_lowercase())
        .execute(&self.pool)
        .await
        .map_err(port_error)?;
        if result.rows_affected() == 0 {
            return Err(PortError::NotFound(format!("account {}", email)));
        }
        info!(%token, "Password reset requested.");
        Ok(())
    }

    async fn current_user(&self) -> PortResult<Option<Identity>> {
        Ok(self.current.borrow().clone())
    }

    fn on_auth_state_change(&self) -> AuthStateStream {
        let rx = self.current.subscribe();
        Box::pin(stream::unfold(rx, |mut rx| async move {
            rx.changed().await.ok()?;
            let identity = rx.borrow_and_update().clone();
            Some((identity, rx))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashes_verify_only_the_original_password() {
        let hash = hash_password("correct horse").unwrap();
        assert!(verify_password("correct horse", &hash));
        assert!(!verify_password("battery staple", &hash));
        assert!(!verify_password("correct horse", "not-a-phc-string"));
    }

    #[test]
    fn weak_credentials_are_rejected() {
        assert!(validate_credentials("nobody", "secret123").is_err());
        assert!(validate_credentials("ada@example.com", "123").is_err());
        assert!(validate_credentials("ada@example.com", "secret123").is_ok());
    }
}
