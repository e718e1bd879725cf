//! 主应用程序入口
//!
//! 装配持久化日志、广播总线、存储与成员校验，启动网关、物化消费者、死信观察者和 Web API。

use std::sync::Arc;

use anyhow::Context;
use application::{
    ensure_topics, topic_specs, ConnectionHub, DeadLetterObserver, DeadLetterPolicy,
    DurableLogClient, Materializer, RealtimeGateway, TopicNames,
};
use config::AppConfig;
use domain::InstanceId;
use infrastructure::Infrastructure;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use web_api::{router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = AppConfig::load().context("加载配置失败")?;
    info!(config = %config.sanitize(), "配置已加载");

    let instance_id = if config.instance_id.is_empty() {
        InstanceId::generate()
    } else {
        InstanceId::parse(config.instance_id.clone())?
    };
    info!(instance_id = %instance_id, "实例标识已确定");

    let infra = Infrastructure::connect(&config)
        .await
        .context("连接基础设施失败")?;

    // 主题开通失败即启动失败
    ensure_topics(infra.admin.as_ref(), &topic_specs(&config.kafka))
        .await
        .context("开通日志主题失败")?;

    let log = Arc::new(DurableLogClient::new(
        Arc::clone(&infra.producer),
        TopicNames::from_config(&config.kafka),
        DeadLetterPolicy::from_config(&config.pipeline),
    ));
    let hub = Arc::new(ConnectionHub::new());
    let gateway = Arc::new(RealtimeGateway::new(
        instance_id,
        Arc::clone(&infra.membership),
        Arc::clone(&infra.bus),
        Arc::clone(&log),
        hub,
    ));

    let shutdown = CancellationToken::new();
    let tasks = TaskTracker::new();

    // 先订阅再启动监听，避免丢失启动期间发布的帧
    let subscription = infra.bus.subscribe().await.context("订阅广播总线失败")?;
    let listener_gateway = Arc::clone(&gateway);
    let token = shutdown.clone();
    tasks.spawn(async move {
        // 订阅丢失后本实例无法再向本地连接推送，停止服务让上游切换实例
        if let Err(err) = listener_gateway.run_bus_listener(subscription, token.clone()).await {
            error!(error = %err, "总线监听异常退出，开始关闭");
            token.cancel();
        }
    });

    if config.pipeline.run_materializer {
        let consumer = infra.consumer(&config.kafka.consumer_group, &config.kafka.messages_topic)?;
        let materializer = Materializer::new(
            consumer,
            Arc::clone(&infra.store),
            Arc::clone(&log),
            config.pipeline.pause_cooldown(),
        );
        let token = shutdown.clone();
        tasks.spawn(async move {
            if let Err(err) = materializer.run(token.clone()).await {
                error!(error = %err, "物化消费者异常退出，开始关闭");
                token.cancel();
            }
        });
    }

    if config.pipeline.run_dead_letter_observer {
        let consumer = infra.consumer(
            &config.kafka.dead_letter_group,
            &config.kafka.dead_letter_topic,
        )?;
        let observer = DeadLetterObserver::new(consumer);
        let token = shutdown.clone();
        tasks.spawn(async move {
            if let Err(err) = observer.run(token).await {
                error!(error = %err, "死信观察者异常退出");
            }
        });
    }
    tasks.close();

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("绑定地址 {addr} 失败"))?;
    info!("消息服务启动在 http://{}", addr);

    let app = router(AppState::new(gateway));
    let server_token = shutdown.clone();
    tokio::spawn(wait_for_signal(shutdown.clone()));
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_token.cancelled().await })
        .await
        .context("HTTP 服务异常退出")?;

    // 服务器可能因错误以外的原因退出，确保后台任务收到关闭信号
    shutdown.cancel();
    tasks.wait().await;
    log.shutdown(config.pipeline.shutdown_grace()).await;
    info!("消息服务已停止");
    Ok(())
}

async fn wait_for_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "无法监听 Ctrl+C 信号");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "无法监听 SIGTERM 信号");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
        _ = shutdown.cancelled() => return,
    }
    info!("收到关闭信号，开始优雅关闭");
    shutdown.cancel();
}
