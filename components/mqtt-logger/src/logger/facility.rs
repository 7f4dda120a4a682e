// Local crates
use crate::logger::logger::LoggerError;

// External crates
use syslog::Facility;

/// Facility used when none is configured.
pub const DEFAULT_FACILITY: &str = "LOG_LOCAL6";

const FACILITIES: [(&str, Facility); 20] = [
    ("LOG_AUTH", Facility::LOG_AUTH),
    ("LOG_AUTHPRIV", Facility::LOG_AUTHPRIV),
    ("LOG_CRON", Facility::LOG_CRON),
    ("LOG_DAEMON", Facility::LOG_DAEMON),
    ("LOG_FTP", Facility::LOG_FTP),
    ("LOG_KERN", Facility::LOG_KERN),
    ("LOG_LPR", Facility::LOG_LPR),
    ("LOG_MAIL", Facility::LOG_MAIL),
    ("LOG_NEWS", Facility::LOG_NEWS),
    ("LOG_SYSLOG", Facility::LOG_SYSLOG),
    ("LOG_USER", Facility::LOG_USER),
    ("LOG_UUCP", Facility::LOG_UUCP),
    ("LOG_LOCAL0", Facility::LOG_LOCAL0),
    ("LOG_LOCAL1", Facility::LOG_LOCAL1),
    ("LOG_LOCAL2", Facility::LOG_LOCAL2),
    ("LOG_LOCAL3", Facility::LOG_LOCAL3),
    ("LOG_LOCAL4", Facility::LOG_LOCAL4),
    ("LOG_LOCAL5", Facility::LOG_LOCAL5),
    ("LOG_LOCAL6", Facility::LOG_LOCAL6),
    ("LOG_LOCAL7", Facility::LOG_LOCAL7),
];

/// Look up a syslog facility by its C macro name, e.g. `LOG_LOCAL6`.
///
/// The `LOG_` prefix is required, case is ignored.
pub fn facility_from_name(name: &str) -> Result<Facility, LoggerError> {
    let wanted = name.trim();
    FACILITIES
        .iter()
        .find(|(known, _)| known.eq_ignore_ascii_case(wanted))
        .map(|(_, facility)| *facility)
        .ok_or_else(|| LoggerError::UnknownFacility(name.to_string()))
}

/// Every facility name accepted by [`facility_from_name`].
pub fn facility_names() -> impl Iterator<Item = &'static str> {
    FACILITIES.iter().map(|(name, _)| *name)
}
