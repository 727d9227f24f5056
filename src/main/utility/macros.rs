/// Log a message at `$first_level` the first time it's hit with a given
/// value, and at `$rest_level` every time after that. `$value` must be
/// `Eq + Hash + Send` and have type `$t`.
macro_rules! log_once_per_value_at_level {
    ($value:expr, $t:ty, $first_level:expr, $rest_level:expr, $($arg:tt)+) => {{
        use std::collections::HashSet;
        use std::sync::Mutex;

        static SEEN: once_cell::sync::Lazy<Mutex<HashSet<$t>>> =
            once_cell::sync::Lazy::new(|| Mutex::new(HashSet::new()));

        let first = SEEN.lock().unwrap().insert($value);
        let level = if first { $first_level } else { $rest_level };
        log::log!(level, $($arg)+);
    }};
}
