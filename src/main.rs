use actix::prelude::*;
use anyhow::Context as _;
use crossterm::{
    cursor, execute, terminal,
    event::{self, Event, KeyCode, KeyModifiers},
};
use log::LevelFilter;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use modeldown::cli;
use modeldown::core::*;
use modeldown::ui::{self, DownloadSummary, ProgressManager};
use modeldown::utils::logger::{Flush, LoggerActor, LoggerExt, SessionLogger};

const KEYBOARD_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// 会话中按键对应的操作
enum KeyAction {
    PauseAll,
    ResumeAll,
    CancelAll,
    Quit,
}

#[actix::main]
async fn main() -> anyhow::Result<()> {
    // 解析参数和配置
    let (args, config) = match cli::Args::parse_args() {
        Ok(parsed) => parsed,
        Err(e) => {
            eprintln!("参数解析失败: {}", e);
            std::process::exit(1);
        }
    };

    let logger = SessionLogger::init(&config.log_file, LevelFilter::Info)
        .with_context(|| format!("无法创建日志文件 {}", config.log_file))?;
    logger.info(&format!(
        "modeldown {} ({}) 启动",
        env!("CARGO_PKG_VERSION"),
        option_env!("VERGEN_GIT_SHA").unwrap_or("unknown")
    ));
    logger.info(&format!("配置文件路径: {}", args.config));
    logger.info(&config.get_summary());

    let controller = QueueController::new(config.clone())
        .with_context(|| format!("无法打开任务记录目录 {}", config.state_dir))?
        .start();

    if args.list {
        for task in controller.send(ListTasks).await? {
            println!("{}", ui::describe_task(&task));
        }
        return finish(&controller, &logger).await;
    }
    if args.purge_finished {
        let removed = controller.send(PurgeFinished).await?;
        ui::print_success(&format!("已删除 {} 条已结束的任务记录", removed));
        return finish(&controller, &logger).await;
    }

    let requests = match args.get_requests() {
        Ok(requests) => requests,
        Err(e) => {
            eprintln!("获取下载列表失败: {}", e);
            controller.send(Shutdown).await?;
            std::process::exit(1);
        }
    };

    println!("{}", config.get_summary());

    let mut events = controller.send(Subscribe).await?;
    let mut progress = ProgressManager::new();
    let mut states: HashMap<TaskId, TaskState> = HashMap::new();

    // 上次未完成的任务一并显示
    for task in controller.send(ListTasks).await? {
        if !task.state.is_terminal() {
            progress.track(&task);
            states.insert(task.id, task.state);
        }
    }

    for request in requests {
        let url = request.url.clone();
        match controller.send(Enqueue(request)).await? {
            Ok(id) => {
                if let Some(task) = controller.send(GetTask(id)).await? {
                    progress.track(&task);
                    states.insert(id, task.state);
                    logger.info(&format!("添加下载任务: {} -> {}", url, task.destination_path.display()));
                }
            }
            Err(e) => {
                logger.error(&format!("添加下载任务失败: {} - {}", url, e));
                ui::print_error(&format!("添加下载任务失败: {} - {}", url, e));
            }
        }
    }

    if states.values().all(|s| s.is_terminal()) {
        println!("没有需要下载的任务");
        return finish(&controller, &logger).await;
    }

    println!("\n开始下载... (按 'p' 暂停, 'r' 恢复, 'c' 取消, 'q' 保存进度并退出)");
    let started = Instant::now();

    terminal::enable_raw_mode()?;
    execute!(std::io::stdout(), cursor::Hide)?;
    let result = run_download_loop(&controller, &mut events, &mut progress, &mut states, &logger).await;
    execute!(std::io::stdout(), cursor::Show)?;
    terminal::disable_raw_mode()?;
    progress.finish();
    result?;

    controller.send(Shutdown).await?;

    let ids: Vec<TaskId> = states.keys().copied().collect();
    let mut tasks = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(task) = controller.send(GetTask(id)).await? {
            tasks.push(task);
        }
    }
    let summary = DownloadSummary::from_tasks(&tasks, started.elapsed());
    println!("{}", summary);
    logger.info(&format!(
        "会话结束 - 成功: {}, 失败: {}, 未完成: {}",
        summary.success_count, summary.failed_count, summary.unfinished_count
    ));
    logger.send(Flush).await?;
    Ok(())
}

async fn finish(controller: &Addr<QueueController>, logger: &Addr<LoggerActor>) -> anyhow::Result<()> {
    controller.send(Shutdown).await?;
    logger.send(Flush).await?;
    Ok(())
}

/// 在独立线程里读取按键，避免阻塞 actix 的事件循环
fn spawn_key_reader() -> mpsc::UnboundedReceiver<KeyAction> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        while !tx.is_closed() {
            if !matches!(event::poll(KEYBOARD_POLL_INTERVAL), Ok(true)) {
                continue;
            }
            let Ok(Event::Key(key)) = event::read() else {
                continue;
            };
            let action = match key.code {
                KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => KeyAction::Quit,
                KeyCode::Char('q') | KeyCode::Char('Q') => KeyAction::Quit,
                KeyCode::Char('p') | KeyCode::Char('P') => KeyAction::PauseAll,
                KeyCode::Char('r') | KeyCode::Char('R') => KeyAction::ResumeAll,
                KeyCode::Char('c') | KeyCode::Char('C') => KeyAction::CancelAll,
                _ => continue,
            };
            if tx.send(action).is_err() {
                break;
            }
        }
    });
    rx
}

/// 运行下载主循环：事件驱动进度条，所有任务结束或用户退出时返回
async fn run_download_loop(
    controller: &Addr<QueueController>,
    events: &mut mpsc::UnboundedReceiver<DownloadEvent>,
    progress: &mut ProgressManager,
    states: &mut HashMap<TaskId, TaskState>,
    logger: &Addr<LoggerActor>,
) -> anyhow::Result<()> {
    let mut keys = spawn_key_reader();
    let mut keys_open = true;

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    break;
                };
                if let DownloadEvent::StateChanged { id, new_state, .. } = &event {
                    if let Some(state) = states.get_mut(id) {
                        *state = *new_state;
                    }
                }
                progress.handle_event(&event);
                if states.values().all(|s| s.is_terminal()) {
                    break;
                }
            }
            action = keys.recv(), if keys_open => {
                let Some(action) = action else {
                    keys_open = false;
                    continue;
                };
                match action {
                    KeyAction::Quit => {
                        progress.println("用户退出, 正在保存进度...");
                        logger.info("用户主动退出下载");
                        break;
                    }
                    KeyAction::PauseAll => {
                        for (id, state) in states.iter() {
                            if state.can_pause() {
                                controller.send(Pause(*id)).await?.ok();
                            }
                        }
                        progress.println("已暂停所有下载任务");
                        logger.info("用户暂停所有下载任务");
                    }
                    KeyAction::ResumeAll => {
                        for (id, state) in states.iter() {
                            if state.can_resume() {
                                controller.send(Resume(*id)).await?.ok();
                            }
                        }
                        progress.println("已恢复所有暂停的任务");
                        logger.info("用户恢复所有下载任务");
                    }
                    KeyAction::CancelAll => {
                        for (id, state) in states.iter() {
                            if state.can_cancel() {
                                controller.send(Cancel { id: *id, delete_partial: false }).await?.ok();
                            }
                        }
                        progress.println("已取消所有下载任务");
                        logger.info("用户取消所有下载任务");
                    }
                }
            }
        }
    }
    Ok(())
}
