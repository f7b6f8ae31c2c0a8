use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use flagpulse::{
    ClientConfig, Context, DataSourceState, DataSourceStatus, FlagValueChangeEvent,
};
use serde_json::{json, Value};

pub fn main() -> flagpulse::Result<()> {
    env_logger::init();

    let sdk_key = std::env::var("FLAGPULSE_SDK_KEY").unwrap_or_else(|_| "demo-sdk-key".to_owned());
    let events_base_url = std::env::var("FLAGPULSE_EVENTS_URL")
        .unwrap_or_else(|_| ClientConfig::DEFAULT_EVENTS_BASE_URL.to_owned());

    // Flag values normally come from a rules engine. Here they live in a map that the demo edits.
    let flags = Arc::new(Mutex::new(HashMap::from([(
        "new-checkout".to_owned(),
        json!(false),
    )])));
    let evaluator_flags = Arc::clone(&flags);

    let client = ClientConfig::from_sdk_key(sdk_key)
        .events_base_url(events_base_url)
        .flush_interval(Duration::from_secs(1))
        .evaluator(move |flag_key: &str, _context: &Context| {
            evaluator_flags
                .lock()
                .map(|flags| flags.get(flag_key).cloned().unwrap_or(Value::Null))
                .unwrap_or(Value::Null)
        })
        .to_client()?;

    client
        .data_source_status_provider()
        .add_status_listener(Arc::new(|status: &DataSourceStatus| {
            println!("Data source is {:?}", status.state);
        }));
    client
        .data_source_status_provider()
        .wait_for(DataSourceState::Valid, Some(Duration::from_secs(1)));

    let context = Context::new("test-subject").with_attribute("country", "NZ");

    let listener = client.flag_tracker().add_flag_value_change_listener(
        "new-checkout",
        context.clone(),
        |event: &FlagValueChangeEvent| {
            println!(
                "{} changed from {} to {}",
                event.flag_key, event.old_value, event.new_value
            );
        },
    );

    client.identify(context.clone());
    let before = client.evaluate("new-checkout", &context, json!(false));
    println!("Assignment: {}", before);

    if let Ok(mut flags) = flags.lock() {
        flags.insert("new-checkout".to_owned(), json!(true));
    }
    client.data_source_updates().flags_changed(["new-checkout"]);

    let after = client.evaluate("new-checkout", &context, json!(false));
    println!("Assignment: {}", after);

    client.track("checkout-completed", context, None, Some(42.0));
    client.flush();

    std::thread::sleep(Duration::from_millis(200));
    client.flag_tracker().remove_flag_change_listener(&listener);

    client.close()
}
