use anyhow::Result;
use storage::LocalStore;

pub const AVATAR_ICON_COUNT: usize = 8;

pub fn avatar_path(index: usize) -> String {
    let index = if index < AVATAR_ICON_COUNT { index } else { 0 };
    format!("img/dp/icon{}.png", index + 1)
}

/// Stored avatar index; missing or out-of-range values read as 0.
pub async fn current_avatar(store: &LocalStore) -> Result<usize> {
    Ok(store
        .avatar_index()
        .await?
        .filter(|index| *index < AVATAR_ICON_COUNT)
        .unwrap_or(0))
}

/// Advances to the next icon, wrapping after the last, and persists it.
pub async fn cycle_avatar(store: &LocalStore) -> Result<usize> {
    let next = (current_avatar(store).await? + 1) % AVATAR_ICON_COUNT;
    store.set_avatar_index(next).await?;
    Ok(next)
}

#[cfg(test)]
#[path = "tests/profile_tests.rs"]
mod tests;
