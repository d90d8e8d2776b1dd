// Prevents additional console window on Windows in release, DO NOT REMOVE!!
#![cfg_attr(not(debug_assertions), windows_subsystem = "windows")]

use companion::inference::{EngineProvider, InferenceEngine, LlamaCliEngine};
use companion::ipc::{InvokeResult, LlmStatus};
use companion::personality::Personality;
use companion::{AppStateMachine, AppStatus, ChatState, CompanionConfig, Mood};
use serde::Serialize;
use std::sync::Arc;
use tauri::{
    menu::{Menu, MenuItem, PredefinedMenuItem},
    tray::{MouseButton, MouseButtonState, TrayIconBuilder, TrayIconEvent},
    Emitter, Manager, RunEvent, State, WindowEvent,
};
use tracing::{error, info};

const MAIN_WINDOW: &str = "main";

struct AppState {
    machine: Arc<AppStateMachine>,
}

type Invoke<T> = Result<InvokeResult<T>, String>;

#[derive(Serialize)]
struct StatusPayload {
    status: AppStatus,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ChatPayload {
    message: String,
    mood: Mood,
}

fn show_main_window(app: &tauri::AppHandle) {
    if let Some(window) = app.get_webview_window(MAIN_WINDOW) {
        let _ = window.show();
        let _ = window.set_focus();
    }
}

#[tauri::command]
fn window_minimize(window: tauri::WebviewWindow) -> Result<(), String> {
    window.minimize().map_err(|e| e.to_string())
}

#[tauri::command]
fn window_maximize(window: tauri::WebviewWindow) -> Result<(), String> {
    if window.is_maximized().unwrap_or(false) {
        window.unmaximize().map_err(|e| e.to_string())
    } else {
        window.maximize().map_err(|e| e.to_string())
    }
}

#[tauri::command]
fn window_close(window: tauri::WebviewWindow) -> Result<(), String> {
    window.hide().map_err(|e| e.to_string())
}

#[tauri::command]
fn get_status(state: State<'_, AppState>) -> LlmStatus {
    state.machine.session_status().into()
}

#[tauri::command]
fn get_state(state: State<'_, AppState>) -> ChatState {
    state.machine.snapshot()
}

#[tauri::command]
fn list_personalities(state: State<'_, AppState>) -> Vec<Personality> {
    state.machine.personalities().into_iter().cloned().collect()
}

#[tauri::command]
fn get_greeting(state: State<'_, AppState>) -> String {
    state.machine.greeting().to_string()
}

#[tauri::command]
async fn check_status(state: State<'_, AppState>) -> Invoke<StatusPayload> {
    let status = state.machine.start().await;
    Ok(InvokeResult::ok(StatusPayload { status }))
}

#[tauri::command]
async fn download_model(state: State<'_, AppState>) -> Invoke<StatusPayload> {
    let result = state
        .machine
        .request_download()
        .await
        .map(|status| StatusPayload { status });
    Ok(InvokeResult::from_result(result))
}

#[tauri::command]
async fn init_llm(state: State<'_, AppState>) -> Invoke<StatusPayload> {
    let result = state
        .machine
        .initialize()
        .await
        .map(|status| StatusPayload { status });
    Ok(InvokeResult::from_result(result))
}

#[tauri::command]
async fn retry_setup(state: State<'_, AppState>) -> Invoke<StatusPayload> {
    let result = state
        .machine
        .retry()
        .await
        .map(|status| StatusPayload { status });
    Ok(InvokeResult::from_result(result))
}

#[tauri::command]
async fn send_message(state: State<'_, AppState>, message: String) -> Invoke<ChatPayload> {
    let result = state
        .machine
        .send_message(&message)
        .await
        .map(|reply| ChatPayload {
            message: reply.content,
            mood: state.machine.snapshot().mood,
        });
    Ok(InvokeResult::from_result(result))
}

#[tauri::command]
async fn set_personality(state: State<'_, AppState>, personality_type: String) -> Invoke<()> {
    match state.machine.set_personality(&personality_type).await {
        Ok(()) => Ok(InvokeResult::done()),
        Err(e) => Ok(InvokeResult::err(e)),
    }
}

#[tauri::command]
async fn set_user_name(state: State<'_, AppState>, name: String) -> Invoke<()> {
    state.machine.set_user_name(&name).await;
    Ok(InvokeResult::done())
}

#[tauri::command]
async fn clear_messages(state: State<'_, AppState>) -> Invoke<()> {
    state.machine.clear_messages();
    Ok(InvokeResult::done())
}

#[tauri::command]
async fn reset_chat(state: State<'_, AppState>) -> Invoke<()> {
    match state.machine.sessions().reset().await {
        Ok(()) => Ok(InvokeResult::done()),
        Err(e) => Ok(InvokeResult::err(e)),
    }
}

fn main() {
    companion::logging::init();

    let config = CompanionConfig::from_env().expect("Failed to resolve application directories");
    info!("Models directory: {:?}", config.models_dir);

    let llama_cli = config.llama_cli.clone();
    let provider = EngineProvider::new(move || {
        let engine = LlamaCliEngine::locate(llama_cli.as_deref())?;
        Ok(Arc::new(engine) as Arc<dyn InferenceEngine>)
    });

    let machine = Arc::new(AppStateMachine::new(&config, provider));

    let app = tauri::Builder::default()
        .plugin(tauri_plugin_shell::init())
        .manage(AppState {
            machine: machine.clone(),
        })
        .setup({
            let machine = machine.clone();
            move |app| {
                // Relay state machine events to the webview.
                let handle = app.handle().clone();
                let mut events = machine.subscribe();
                tauri::async_runtime::spawn(async move {
                    loop {
                        match events.recv().await {
                            Ok(event) => {
                                if let Err(e) = handle.emit(event.channel(), event.payload()) {
                                    error!("Failed to emit {}: {}", event.channel(), e);
                                }
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                                info!("UI event relay skipped {} events", skipped);
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        }
                    }
                });

                let open = MenuItem::with_id(app, "open", "開く", true, None::<&str>)?;
                let separator = PredefinedMenuItem::separator(app)?;
                let quit = MenuItem::with_id(app, "quit", "終了", true, None::<&str>)?;
                let menu = Menu::with_items(app, &[&open, &separator, &quit])?;

                let mut tray = TrayIconBuilder::new()
                    .tooltip("AIチャットコンパニオン")
                    .menu(&menu)
                    .on_menu_event(|app, event| match event.id.as_ref() {
                        "open" => show_main_window(app),
                        "quit" => app.exit(0),
                        _ => {}
                    })
                    .on_tray_icon_event(|tray, event| {
                        if let TrayIconEvent::Click {
                            button: MouseButton::Left,
                            button_state: MouseButtonState::Up,
                            ..
                        } = event
                        {
                            show_main_window(tray.app_handle());
                        }
                    });
                if let Some(icon) = app.default_window_icon() {
                    tray = tray.icon(icon.clone());
                }
                tray.build(app)?;

                // Closing the window hides it to the tray.
                if let Some(window) = app.get_webview_window(MAIN_WINDOW) {
                    let window_clone = window.clone();
                    window.on_window_event(move |event| {
                        if let WindowEvent::CloseRequested { api, .. } = event {
                            api.prevent_close();
                            let _ = window_clone.hide();
                        }
                    });
                }

                Ok(())
            }
        })
        .invoke_handler(tauri::generate_handler![
            window_minimize,
            window_maximize,
            window_close,
            get_status,
            get_state,
            list_personalities,
            get_greeting,
            check_status,
            download_model,
            init_llm,
            retry_setup,
            send_message,
            set_personality,
            set_user_name,
            clear_messages,
            reset_chat
        ])
        .build(tauri::generate_context!())
        .expect("error while building tauri application");

    app.run(move |_app, event| {
        if let RunEvent::Exit = event {
            tauri::async_runtime::block_on(machine.shutdown());
        }
    });
}
