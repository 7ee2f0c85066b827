#![no_main]

use libfuzzer_sys::fuzz_target;
use warden_access::PriorityOrder;
use warden_notify::{plan_notify_delivery, resolve_target_overrides, NotifyRequest};

fuzz_target!(|data: &[u8]| {
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(data) else {
        return;
    };
    let order = PriorityOrder::default();
    let overrides = resolve_target_overrides(&value, &order);
    let Ok(request) = NotifyRequest::from_value(value) else {
        return;
    };
    let plan = plan_notify_delivery(&request, &order, &overrides);
    assert_eq!(
        plan.deliveries.len(),
        request.chat_ids_for_target(&plan.target).len()
    );
});
