use serde::{Deserialize, Deserializer};

/// Treats an explicit JSON `null` like a missing field.
///
/// The engine emits nil slices and maps as `null`, which plain
/// `#[serde(default)]` rejects.
pub(crate) fn null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

pub(crate) fn is_false(value: &bool) -> bool {
    !*value
}

pub(crate) fn is_zero(value: &i64) -> bool {
    *value == 0
}
