use std::collections::HashMap;

use crate::error::{Error, Result};

pub(crate) const SERVICE_NAME: &str = "keepr";

fn attributes(server: &str) -> HashMap<&str, &str> {
    let mut attrs = HashMap::new();
    attrs.insert("service", SERVICE_NAME);
    attrs.insert("server", server);
    attrs
}

async fn open() -> Result<oo7::Keyring> {
    oo7::Keyring::new()
        .await
        .map_err(|e| Error::Keyring(format!("Failed to connect to keyring: {}", e)))
}

/// Store the session's refresh token in the system keyring via Secret Service.
pub async fn store_refresh_token(server: &str, token: &str) -> Result<()> {
    let keyring = open().await?;
    keyring
        .create_item(
            &format!("keepr session ({})", server),
            &attributes(server),
            token.as_bytes(),
            true, // replace existing
        )
        .await
        .map_err(|e| Error::Keyring(format!("Failed to store session: {}", e)))?;
    Ok(())
}

/// Load the refresh token saved by a previous sign-in, if any.
pub async fn load_refresh_token(server: &str) -> Result<Option<String>> {
    let keyring = open().await?;
    let items = keyring
        .search_items(&attributes(server))
        .await
        .map_err(|e| Error::Keyring(format!("Failed to search keyring: {}", e)))?;

    let Some(item) = items.first() else {
        return Ok(None);
    };
    let secret = item
        .secret()
        .await
        .map_err(|e| Error::Keyring(format!("Failed to read secret: {}", e)))?;
    let token = String::from_utf8(secret.to_vec())
        .map_err(|e| Error::Keyring(format!("Invalid UTF-8 in secret: {}", e)))?;
    Ok(Some(token).filter(|t| !t.is_empty()))
}

pub async fn delete_refresh_token(server: &str) -> Result<()> {
    let keyring = open().await?;
    let items = keyring
        .search_items(&attributes(server))
        .await
        .map_err(|e| Error::Keyring(format!("Failed to search keyring: {}", e)))?;

    for item in items {
        item.delete()
            .await
            .map_err(|e| Error::Keyring(format!("Failed to delete session: {}", e)))?;
    }
    Ok(())
}
