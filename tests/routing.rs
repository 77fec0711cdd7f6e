#![deny(rust_2018_idioms)]

use std::{collections::HashSet, sync::Arc, time::Duration};

use tokio::net::TcpListener;
use wmrouter::{
    checker_from_str, ConfigOption, Dialer, DialerRef, Direct, Forwarder, Registry, RuleConfig,
    RuleDialer, Socks5Dialer, StrategyConfig, StrategyDialer,
};

fn pool(strategy: &str, urls: &[&str]) -> StrategyDialer {
    let forwarders = urls
        .iter()
        .map(|u| Forwarder::new(u.to_string(), Arc::new(Direct::default()), 0))
        .collect();
    let config = StrategyConfig {
        strategy: strategy.to_string(),
        ..Default::default()
    };
    StrategyDialer::new(strategy, forwarders, &config).unwrap()
}

#[test]
fn rule_feedback_scenario() {
    let mut option = ConfigOption::default();
    option.forward = vec!["socks5://127.0.0.1:1080".to_string()];
    option.rules.push(RuleConfig {
        name: "p1".to_string(),
        forward: vec!["http://10.0.0.1:8080".to_string()],
        domain: vec!["example.com".to_string()],
        ..Default::default()
    });
    let dialer = Arc::new(RuleDialer::from_option(&option, &Registry::with_builtin()).unwrap());
    let table = dialer.table().clone();

    assert_eq!(table.resolve("example.com:443").name(), "p1");
    assert_eq!(table.resolve("other.com:443").name(), "default");
    // 没有反馈前结果不变
    for _ in 0..3 {
        assert_eq!(table.resolve("93.184.216.34:443").name(), "default");
    }

    dialer.add_domain_ip("example.com", "93.184.216.34".parse().unwrap()).unwrap();
    assert_eq!(table.resolve("93.184.216.34:443").name(), "p1");
    assert_eq!(dialer.clone().next_dialer("93.184.216.34:443").addr(), "10.0.0.1:8080");
    assert_eq!(dialer.clone().next_dialer("other.com:443").addr(), "127.0.0.1:1080");

    // 不受规则管理的域名不产生绑定
    dialer.add_domain_ip("other.com", "1.2.3.4".parse().unwrap()).unwrap();
    assert_eq!(table.resolve("1.2.3.4:443").name(), "default");
}

#[test]
fn failover_scenario() {
    let pool = pool("ha", &["f1", "f2"]);
    let f1 = pool.forwarders()[0].clone();
    f1.record_failure();
    assert_eq!(pool.pick("example.com:80").url(), "f2");
    f1.record_success(Duration::from_millis(20));
    assert_eq!(pool.pick("example.com:80").url(), "f1");
}

#[test]
fn failover_respects_priority() {
    let registry = Registry::with_builtin();
    let forwarders = vec![
        Forwarder::parse("socks5://10.0.0.1:1080", &registry, None).unwrap(),
        Forwarder::parse("socks5://10.0.0.2:1080#priority=10", &registry, None).unwrap(),
        Forwarder::parse("socks5://10.0.0.3:1080#priority=5", &registry, None).unwrap(),
    ];
    let config = StrategyConfig {
        strategy: "ha".to_string(),
        ..Default::default()
    };
    let pool = StrategyDialer::new("ha", forwarders, &config).unwrap();
    assert_eq!(pool.pick("a:1").addr(), "10.0.0.2:1080");
    pool.forwarders()[0].record_failure();
    assert_eq!(pool.pick("a:1").addr(), "10.0.0.3:1080");
    pool.forwarders()[1].record_failure();
    assert_eq!(pool.pick("a:1").addr(), "10.0.0.1:1080");
    pool.forwarders()[0].record_success(Duration::from_millis(5));
    assert_eq!(pool.pick("a:1").addr(), "10.0.0.2:1080");
}

#[test]
fn round_robin_visits_each_alive_once() {
    let pool = pool("rr", &["a", "b", "c", "d"]);
    pool.forwarders()[2].record_failure();
    let mut seen = HashSet::new();
    for _ in 0..3 {
        seen.insert(pool.pick("x:1").url().to_string());
    }
    assert_eq!(seen.len(), 3);
    assert!(!seen.contains("c"));
}

#[test]
fn all_dead_still_returns_forwarder() {
    let pool = pool("rr", &["a", "b"]);
    pool.forwarders()[0].record_failure();
    std::thread::sleep(Duration::from_millis(5));
    pool.forwarders()[1].record_failure();
    assert_eq!(pool.pick("x:1").url(), "a");
}

#[tokio::test]
async fn tcp_check_drives_health() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let up = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((_s, _)) = listener.accept().await {}
    });
    let down = {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        l.local_addr().unwrap()
    };

    let forwarder = Forwarder::new("direct://".to_string(), Arc::new(Direct::default()), 0);
    let checker = checker_from_str(&format!("tcp://{}", down)).unwrap().unwrap();
    match checker.check(&forwarder).await {
        Ok(_) => forwarder.record_success(Duration::ZERO),
        Err(_) => forwarder.record_failure(),
    }
    assert!(!forwarder.is_alive());

    let checker = checker_from_str(&format!("tcp://{}", up)).unwrap().unwrap();
    let latency = checker.check(&forwarder).await.unwrap();
    forwarder.record_success(latency);
    assert!(forwarder.is_alive());
    assert!(checker_from_str("disable").unwrap().is_none());
}

fn spawn_accept(listener: TcpListener) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Ok((_s, _)) = listener.accept().await {}
    })
}

async fn wait_until<F: Fn() -> bool>(cond: F) -> bool {
    for _ in 0..100 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn background_check_follows_target() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target = listener.local_addr().unwrap();
    let accept = spawn_accept(listener);

    let direct: DialerRef = Arc::new(Direct::default());
    // 第一个转发器永远连不上, 第二个直连
    let broken = Forwarder::new(
        "socks5://127.0.0.1:1".to_string(),
        Arc::new(Socks5Dialer::new("127.0.0.1:1".to_string(), direct.clone())),
        0,
    );
    let good = Forwarder::new("direct://".to_string(), direct, 0);
    let config = StrategyConfig {
        strategy: "ha".to_string(),
        check: format!("tcp://{}", target),
        check_interval: Duration::from_millis(50).into(),
        check_timeout: Duration::from_millis(500).into(),
        ..Default::default()
    };
    let pool = StrategyDialer::new("ha", vec![broken, good], &config).unwrap();
    assert_eq!(pool.pick("a:1").url(), "socks5://127.0.0.1:1");
    pool.check().unwrap();

    let broken = pool.forwarders()[0].clone();
    let good = pool.forwarders()[1].clone();
    assert!(wait_until(|| !broken.is_alive() && good.is_alive()).await);
    assert_eq!(pool.pick("a:1").url(), "direct://");

    // 目标关闭后直连的转发器也变为不可用
    accept.abort();
    assert!(wait_until(|| !good.is_alive()).await);

    // 目标恢复后重新可用
    let listener = TcpListener::bind(target).await.unwrap();
    let _accept = spawn_accept(listener);
    assert!(wait_until(|| good.is_alive()).await);
    assert_eq!(pool.pick("a:1").url(), "direct://");
}
