use crate::config::MessageConfig;
use crate::netatmo::SensorReading;

/// Text to speak. Empty text means the notification is suppressed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Notification {
    pub text: String,
}

impl Notification {
    pub fn is_suppressed(&self) -> bool {
        self.text.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct MessagePolicy {
    pub threshold: i64,
    pub report: String,
    pub advice: String,
}

impl MessagePolicy {
    pub fn new(threshold: i64, config: &MessageConfig) -> Self {
        Self {
            threshold,
            report: config.report.clone(),
            advice: config.advice.clone(),
        }
    }

    /// Fills both placeholders in one pass over the template, so text coming
    /// from the location is never expanded again.
    fn report_for(&self, location: &str, value: i64) -> String {
        let value = value.to_string();
        let mut out = String::with_capacity(self.report.len() + location.len());
        let mut rest = self.report.as_str();
        while let Some(start) = rest.find('{') {
            out.push_str(&rest[..start]);
            let tail = &rest[start..];
            if let Some(after) = tail.strip_prefix("{location}") {
                out.push_str(location);
                rest = after;
            } else if let Some(after) = tail.strip_prefix("{value}") {
                out.push_str(&value);
                rest = after;
            } else {
                out.push('{');
                rest = &tail[1..];
            }
        }
        out.push_str(rest);
        out
    }
}

pub fn compose(reading: &SensorReading, forced: bool, policy: &MessagePolicy) -> Notification {
    let Some(value) = reading.co2_ppm else {
        log::warn!("No CO2 reading for {}, nothing to say", reading.location);
        return Notification::default();
    };

    let over = value >= policy.threshold;
    let mut text = String::new();
    if over || forced {
        text.push_str(&policy.report_for(&reading.location, value));
    }
    if over {
        text.push_str(&policy.advice);
    }

    log::info!("message='{}'", text);
    Notification { text }
}
