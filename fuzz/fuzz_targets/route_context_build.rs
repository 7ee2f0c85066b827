#![no_main]

use libfuzzer_sys::fuzz_target;
use warden_router::{MessageEvent, RouteContext, RouteSettings};

fuzz_target!(|data: &[u8]| {
    let text = String::from_utf8_lossy(data).into_owned();
    let settings = RouteSettings {
        bot_usernames: vec!["wardenbot".to_string()],
        ..RouteSettings::default()
    };
    let event = MessageEvent {
        channel: "telegram".to_string(),
        chat_id: "-100".to_string(),
        chat_type: "supergroup".to_string(),
        user_id: "1".to_string(),
        message_id: Some("1".to_string()),
        text,
        ..MessageEvent::default()
    };
    let ctx = RouteContext::build(event, &settings);
    assert_eq!(ctx.is_slash_command, ctx.cleaned_text.starts_with('/'));
    if ctx.is_slash_command {
        assert!(!ctx.allow_resolve);
    }
    let _ = warden_router::classify_legacy(&ctx);
});
