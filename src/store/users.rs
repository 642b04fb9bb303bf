//! User store
//!
//! Usernames are unique ignoring ASCII case. Passwords are stored as bcrypt
//! hashes and verified on the blocking thread pool.

use super::{load_json, save_json, USERS_FILE};
use crate::error::ProxyError;
use crate::socks::auth::UserValidator;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// A stored user
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    /// Login name
    pub username: String,
    /// bcrypt hash of the password
    pub password: String,
}

/// `users.json` backed user store
#[derive(Debug)]
pub struct UserStore {
    path: PathBuf,
    cost: u32,
    users: RwLock<Vec<User>>,
}

impl UserStore {
    /// Load `users.json` from `data_dir`
    pub fn open<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        UserStore::open_file(data_dir.as_ref().join(USERS_FILE))
    }

    /// Load a user store from an explicit file
    pub fn open_file(path: PathBuf) -> Result<Self> {
        let users: Vec<User> = load_json(&path)?;
        debug!("Loaded {} users from {:?}", users.len(), path);

        Ok(UserStore {
            path,
            cost: bcrypt::DEFAULT_COST,
            users: RwLock::new(users),
        })
    }

    /// Override the bcrypt cost used for new hashes
    pub fn with_cost(mut self, cost: u32) -> Self {
        self.cost = cost;
        self
    }

    /// Look a user up by name
    pub async fn get(&self, username: &str) -> Option<User> {
        let users = self.users.read().await;
        users
            .iter()
            .find(|u| u.username.eq_ignore_ascii_case(username))
            .cloned()
    }

    /// All users
    pub async fn list(&self) -> Vec<User> {
        self.users.read().await.clone()
    }

    /// Add a user with a plain-text password
    pub async fn add(&self, username: &str, password: &str) -> Result<()> {
        if username.is_empty() {
            return Err(ProxyError::Store("Username must not be empty".to_string()).into());
        }
        let hash = hash_password(password.to_string(), self.cost).await?;

        let mut users = self.users.write().await;
        if users.iter().any(|u| u.username.eq_ignore_ascii_case(username)) {
            return Err(ProxyError::Store(format!("User '{}' already exists", username)).into());
        }
        let mut updated = users.clone();
        updated.push(User {
            username: username.to_string(),
            password: hash,
        });
        save_json(&self.path, &updated).await?;
        *users = updated;

        info!("Added user {}", username);
        Ok(())
    }

    /// Replace a user's password
    pub async fn update_password(&self, username: &str, password: &str) -> Result<()> {
        let hash = hash_password(password.to_string(), self.cost).await?;

        let mut users = self.users.write().await;
        let mut updated = users.clone();
        let user = updated
            .iter_mut()
            .find(|u| u.username.eq_ignore_ascii_case(username))
            .ok_or_else(|| ProxyError::Store(format!("User '{}' not found", username)))?;
        user.password = hash;
        save_json(&self.path, &updated).await?;
        *users = updated;

        info!("Updated password for {}", username);
        Ok(())
    }

    /// Delete a user, returning whether one was removed
    pub async fn delete(&self, username: &str) -> Result<bool> {
        let mut users = self.users.write().await;
        let mut updated = users.clone();
        updated.retain(|u| !u.username.eq_ignore_ascii_case(username));
        if updated.len() == users.len() {
            return Ok(false);
        }
        save_json(&self.path, &updated).await?;
        *users = updated;

        info!("Deleted user {}", username);
        Ok(true)
    }

    /// Check a username/password pair
    pub async fn verify(&self, username: &str, password: &str) -> bool {
        let hash = match self.get(username).await {
            Some(user) => user.password,
            None => return false,
        };

        let password = password.to_string();
        match tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash)).await {
            Ok(Ok(valid)) => valid,
            Ok(Err(e)) => {
                debug!("Stored hash for {} is unusable: {}", username, e);
                false
            }
            Err(e) => {
                debug!("Password verification task failed: {}", e);
                false
            }
        }
    }
}

async fn hash_password(password: String, cost: u32) -> Result<String> {
    tokio::task::spawn_blocking(move || bcrypt::hash(password, cost))
        .await
        .context("Password hashing task failed")?
        .map_err(|e| ProxyError::Store(format!("Failed to hash password: {}", e)).into())
}

#[async_trait]
impl UserValidator for UserStore {
    async fn validate(&self, username: &str, password: &str) -> bool {
        self.verify(username, password).await
    }
}
