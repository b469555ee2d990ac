use std::collections::HashMap;

use serde_json::Value;

use crate::types::*;

/// Collects `(path, old, new)` for every leaf that differs between two JSON
/// documents. Keys only present in `previous` are ignored.
pub(crate) fn diff_json(
    previous: &Value,
    current: &Value,
    path_prefix: &str,
    changes: &mut Vec<(String, Value, Value)>,
) {
    match (previous, current) {
        (Value::Object(prev_map), Value::Object(curr_map)) => {
            for (key, curr_val) in curr_map {
                let path = if path_prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{path_prefix}.{key}")
                };
                match prev_map.get(key) {
                    Some(prev_val) => diff_json(prev_val, curr_val, &path, changes),
                    None => {
                        if curr_val.is_object() {
                            diff_json(&Value::Object(serde_json::Map::new()), curr_val, &path, changes);
                        } else {
                            changes.push((path, Value::Null, curr_val.clone()));
                        }
                    }
                }
            }
        }
        (prev, curr) if prev != curr => {
            changes.push((path_prefix.to_string(), prev.clone(), curr.clone()));
        }
        _ => {}
    }
}

/// Change events between two consecutive snapshots. The first snapshot
/// produces nothing unless it is already triggered.
pub(crate) fn diff_snapshots(
    previous: Option<&VestaData>,
    current: &VestaData,
    rules: &TriggerRules,
) -> Vec<Event> {
    let mut events = Vec::new();
    let was_triggered = previous.is_some_and(|p| p.is_triggered(rules));
    let now_triggered = current.is_triggered(rules);

    let Some(prev) = previous else {
        if now_triggered && let Some(entry) = current.latest_event() {
            events.push(Event::AlarmTriggered { entry: entry.clone() });
        }
        return events;
    };

    diff_panel(&prev.panel, &current.panel, &mut events);
    diff_devices(&prev.devices, &current.devices, &mut events);

    let fresh = new_log_entries(&prev.event_log, &current.event_log);
    if !fresh.is_empty() {
        events.push(Event::NewLogEntries { entries: fresh });
    }

    match (was_triggered, now_triggered) {
        (false, true) => {
            if let Some(entry) = current.latest_event() {
                events.push(Event::AlarmTriggered { entry: entry.clone() });
            }
        }
        (true, false) => events.push(Event::AlarmCleared),
        _ => {}
    }

    events
}

fn diff_panel(prev: &PanelStatus, curr: &PanelStatus, events: &mut Vec<Event>) {
    if prev.mode != curr.mode {
        events.push(Event::ModeChanged {
            mode: curr.mode.clone(),
            state: curr.alarm_state(),
        });
    }
    if prev.ac_failure != curr.ac_failure {
        events.push(Event::AcFailureChanged { failed: curr.ac_failure });
    }
    if prev.battery_status != curr.battery_status {
        events.push(Event::PanelBatteryChanged {
            status: curr.battery_status.clone(),
        });
    }
    if prev.gsm_signal != curr.gsm_signal {
        events.push(Event::GsmSignalChanged { signal: curr.gsm_signal });
    }
}

fn diff_devices(prev: &[DeviceStatus], curr: &[DeviceStatus], events: &mut Vec<Event>) {
    let prev_by_id: HashMap<&str, &DeviceStatus> =
        prev.iter().map(|d| (d.device_id.as_str(), d)).collect();
    let curr_by_id: HashMap<&str, &DeviceStatus> =
        curr.iter().map(|d| (d.device_id.as_str(), d)).collect();

    for device in curr {
        let Some(old) = prev_by_id.get(device.device_id.as_str()) else {
            events.push(Event::DeviceAdded {
                device_id: device.device_id.clone(),
                name: device.name.clone(),
            });
            continue;
        };
        if old.status != device.status {
            events.push(Event::DeviceStatusChanged {
                device_id: device.device_id.clone(),
                name: device.name.clone(),
                zone: device.zone,
                status: device.status.clone(),
                active: device.is_active(),
            });
        }
        if old.battery_ok != device.battery_ok {
            events.push(Event::DeviceBatteryChanged {
                device_id: device.device_id.clone(),
                name: device.name.clone(),
                battery_ok: device.battery_ok,
            });
        }
        if old.tamper_ok != device.tamper_ok {
            events.push(Event::DeviceTamperChanged {
                device_id: device.device_id.clone(),
                name: device.name.clone(),
                tamper_ok: device.tamper_ok,
            });
        }
    }

    for device in prev {
        if !curr_by_id.contains_key(device.device_id.as_str()) {
            events.push(Event::DeviceRemoved {
                device_id: device.device_id.clone(),
                name: device.name.clone(),
            });
        }
    }
}

/// Entries at the head of `curr` that were not in `prev`. Uses the uid when
/// the panel sends one, otherwise stops at the previous head row.
fn new_log_entries(prev: &[EventLogEntry], curr: &[EventLogEntry]) -> Vec<EventLogEntry> {
    let Some(prev_head) = prev.first() else {
        return Vec::new();
    };
    match prev_head.uid {
        Some(last_uid) => curr
            .iter()
            .take_while(|e| e.uid.is_some_and(|uid| uid > last_uid))
            .cloned()
            .collect(),
        None => match curr.iter().position(|e| e == prev_head) {
            Some(idx) => curr[..idx].to_vec(),
            None => Vec::new(),
        },
    }
}
