pub const TOPIC_PREFIX: &str = "homelink";

pub const TOPIC_SENSOR_TEMP: &str = "homelink/sensor/temperature";
pub const TOPIC_SENSOR_HUMIDITY: &str = "homelink/sensor/humidity";
pub const TOPIC_SENSOR_STATUS: &str = "homelink/sensor/status";
pub const TOPIC_SENSOR_REPORT: &str = "homelink/sensor/report";

pub const TOPIC_CMD_SENSOR: &str = "homelink/cmnd/sensor";

/// Builds `homelink/<node>/<leaf>` for nodes that are not listed above.
pub fn node_topic(node: &str, leaf: &str) -> String {
    format!(
        "{TOPIC_PREFIX}/{}/{}",
        node.trim_matches('/'),
        leaf.trim_matches('/')
    )
}
