use std::fmt;

use serde::{Deserialize, Serialize};

/// A row of the `stations` table as the JDBC connector publishes it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Station {
    pub stop_id: i64,
    pub direction_id: String,
    pub stop_name: String,
    pub station_name: String,
    pub station_descriptive_name: String,
    pub station_id: i64,
    pub order: i64,
    pub red: bool,
    pub blue: bool,
    pub green: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Line {
    Red,
    Blue,
    Green,
}

impl fmt::Display for Line {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Line::Red => "red",
            Line::Blue => "blue",
            Line::Green => "green",
        })
    }
}

/// Compact station record keyed by `station_id` in the stations table topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformedStation {
    pub station_id: i64,
    pub station_name: String,
    pub order: i64,
    pub line: Line,
}

impl From<Station> for TransformedStation {
    fn from(station: Station) -> Self {
        // A station flagged for several lines keeps the first of red, blue
        let line = if station.red {
            Line::Red
        } else if station.blue {
            Line::Blue
        } else {
            Line::Green
        };

        Self {
            station_id: station.station_id,
            station_name: station.station_name,
            order: station.order,
            line,
        }
    }
}
