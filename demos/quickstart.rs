use salon_chat::business::StaticBusinessData;
use salon_chat::context::GenerationRequest;
use salon_chat::orchestrator::reply_text;
use salon_chat::{
    create_session_store, ChatConfig, ChatResult, InboundMessage, SessionBackendConfig,
    TurnOrchestrator,
};
use serde_json::json;
use std::sync::Arc;

const CONFIG: &str = r#"{
    "session": { "history_cap": 10, "idle_ttl_secs": 3600 },
    "cache": { "default_ttl_ms": 300000 },
    "tenants": [
        {
            "key": "eunoia",
            "business_name": "EUNOIA Urban Beauty",
            "assistant_name": "Noia",
            "default_language": "de"
        }
    ]
}"#;

/// Stands in for the hosted model: echoes what it was asked, in the chosen language.
fn canned_model(request: &GenerationRequest) -> ChatResult<String> {
    let opener = if request.first_contact { "Hallo! Ich bin Noia. " } else { "" };
    Ok(format!(
        "{opener}[{}] Du hast gefragt: {}",
        request.language, request.user_message
    ))
}

fn main() -> ChatResult<()> {
    let config = ChatConfig::from_json_str(CONFIG)?;
    let sessions = create_session_store(SessionBackendConfig::InMemory, config.session.clone())?;
    let business = StaticBusinessData::new().with_tenant(
        "eunoia",
        json!({
            "services": ["Brazilian Waxing", "Beine komplett"],
            "opening_hours": "Mo-Fr 10-19, Sa 10-16",
            "booking": "https://eunoia.example/booking"
        }),
    );
    let orchestrator =
        TurnOrchestrator::from_config(&config, sessions, Arc::new(business), Arc::new(canned_model));

    for text in [
        "Hallo",
        "Wann habt ihr heute offen?",
        "Can you tell me what the price for a brazilian is?",
        "ja",
    ] {
        let outcome = orchestrator.handle(InboundMessage::from_chat("eunoia", "demo-user", text));
        let (reply, ok) = reply_text(&outcome);
        println!("> {text}\n< {reply} (ok: {ok})");
    }
    Ok(())
}
