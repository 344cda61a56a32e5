//! Conversion of caller property lists into the server's form, and parsing
//! of the properties a play request is steered by.

use crate::error::{DriverError, Result};
use bridge_traits::{keys, CacheControl, PropList, ServerPropList, Volume};
use tracing::debug;

/// Copy every entry of a caller list into a server list.
///
/// The caller list stays locked for the duration of the copy. A key the
/// server would reject yields [`DriverError::Invalid`].
pub fn to_server_props(props: &PropList) -> Result<ServerPropList> {
    props.with_locked(|entries| {
        let mut out = ServerPropList::new();
        for entry in entries {
            out.set(entry.key(), entry.value()).map_err(|err| {
                debug!(key = entry.key(), error = %err, "Rejected property key");
                DriverError::Invalid
            })?;
        }
        Ok(out)
    })
}

/// Remove the driver's own control keys so they never reach the server.
pub fn strip_internal_keys(props: &mut ServerPropList) {
    props.retain(|key, _| !key.starts_with(keys::INTERNAL_PREFIX));
}

/// The `event.id` of a request. Required.
pub fn event_id(props: &ServerPropList) -> Result<String> {
    props
        .gets(keys::EVENT_ID)
        .map(str::to_string)
        .ok_or(DriverError::Invalid)
}

/// Playback volume from the decibel property, `NORM` when absent.
///
/// `-inf` mutes. NaN, `+inf` and text that is not a number are rejected.
pub fn volume(props: &ServerPropList) -> Result<Volume> {
    let Some(raw) = props.gets(keys::VOLUME) else {
        return Ok(Volume::NORM);
    };

    let db: f64 = raw.trim().parse().map_err(|_| DriverError::Invalid)?;
    if db.is_nan() || db == f64::INFINITY {
        return Err(DriverError::Invalid);
    }
    Ok(Volume::from_db(db))
}

/// Cache policy, `None` when the property is absent.
pub fn cache_control(props: &ServerPropList) -> Result<Option<CacheControl>> {
    props
        .gets(keys::CACHE_CONTROL)
        .map(|raw| raw.parse::<CacheControl>().map_err(|_| DriverError::Invalid))
        .transpose()
}

/// Everything a play request reads from its properties.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestProps {
    pub event_id: String,
    pub volume: Volume,
    pub cache_control: Option<CacheControl>,
}

impl RequestProps {
    pub fn parse(props: &ServerPropList) -> Result<Self> {
        Ok(Self {
            event_id: event_id(props)?,
            volume: volume(props)?,
            cache_control: cache_control(props)?,
        })
    }

    /// Policy with the default applied.
    pub fn policy(&self) -> CacheControl {
        self.cache_control.unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_props(pairs: &[(&str, &str)]) -> ServerPropList {
        let list = PropList::new();
        for (key, value) in pairs {
            list.sets(*key, value);
        }
        to_server_props(&list).unwrap()
    }

    #[test]
    fn test_conversion_copies_all_entries() {
        let props = server_props(&[
            (keys::EVENT_ID, "bell"),
            (keys::MEDIA_NAME, "Bell"),
            (keys::VOLUME, "-6"),
        ]);
        assert_eq!(props.len(), 3);
        assert_eq!(props.gets(keys::MEDIA_NAME), Some("Bell"));
    }

    #[test]
    fn test_conversion_rejects_bad_key() {
        let list = PropList::new();
        list.sets("bad=key", "x");
        assert_eq!(to_server_props(&list), Err(DriverError::Invalid));
    }

    #[test]
    fn test_strip_internal_keys() {
        let mut props = server_props(&[
            (keys::EVENT_ID, "bell"),
            (keys::VOLUME, "-6"),
            (keys::CACHE_CONTROL, "volatile"),
        ]);
        strip_internal_keys(&mut props);
        assert_eq!(props.keys().collect::<Vec<_>>(), vec![keys::EVENT_ID]);

        let mut only_internal = server_props(&[(keys::THEME_NAME, "oxygen")]);
        strip_internal_keys(&mut only_internal);
        assert!(only_internal.is_empty());
    }

    #[test]
    fn test_parse_defaults() {
        let request = RequestProps::parse(&server_props(&[(keys::EVENT_ID, "bell")])).unwrap();
        assert_eq!(request.event_id, "bell");
        assert_eq!(request.volume, Volume::NORM);
        assert_eq!(request.cache_control, None);
        assert_eq!(request.policy(), CacheControl::Never);
    }

    #[test]
    fn test_parse_requires_event_id() {
        let props = server_props(&[(keys::MEDIA_NAME, "Bell")]);
        assert_eq!(RequestProps::parse(&props), Err(DriverError::Invalid));
    }

    #[test]
    fn test_volume_parsing() {
        let vol = |raw: &str| volume(&server_props(&[(keys::VOLUME, raw)]));

        assert!((vol("-20").unwrap().linear() - 0.1).abs() < 1e-9);
        assert_eq!(vol("0").unwrap(), Volume::NORM);
        assert_eq!(vol("-inf").unwrap(), Volume::MUTED);
        assert_eq!(vol("abc"), Err(DriverError::Invalid));
        assert_eq!(vol("nan"), Err(DriverError::Invalid));
        assert_eq!(vol("inf"), Err(DriverError::Invalid));
        assert_eq!(vol(""), Err(DriverError::Invalid));
    }

    #[test]
    fn test_cache_control_parsing() {
        let policy = |raw: &str| cache_control(&server_props(&[(keys::CACHE_CONTROL, raw)]));

        assert_eq!(policy("volatile"), Ok(Some(CacheControl::Volatile)));
        assert_eq!(policy("permanent"), Ok(Some(CacheControl::Permanent)));
        assert_eq!(policy("never"), Ok(Some(CacheControl::Never)));
        assert_eq!(policy("sometimes"), Err(DriverError::Invalid));
    }
}
