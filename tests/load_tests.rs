#[cfg(test)]
mod tests {
    use warden::{
        config::{AsyncDecl, Catalog, Declarations, GroupDecl, LockDecl, ThrottleDecl},
        errors::ControlError,
        handle::Promise,
        pool::{PoolSpec, QueueKind, RejectionPolicy},
        target::TargetId,
        Warden,
    };
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        thread,
        time::{Duration, Instant},
    };

    fn measure<F, T>(name: &str, f: F) -> T
    where
        F: FnOnce() -> T,
    {
        let start = Instant::now();
        let result = f();
        let elapsed = start.elapsed();
        println!("✓ {}: {:?}", name, elapsed);
        result
    }

    #[test]
    fn load_test_1_many_small_dispatches() {
        println!("\n=== LOAD TEST 1: 10k коротких dispatch ===");
        let catalog = Catalog::new()
            .with_pool(
                PoolSpec::builder("fast")
                    .with_core(num_cpus::get())
                    .with_max(num_cpus::get() * 2)
                    .build()
                    .unwrap(),
            )
            .with_type("load::Fast", Declarations::new().with_async(AsyncDecl::pool("fast")));
        let warden = Warden::builder().catalog(catalog).build();
        let target = TargetId::deferred("load::Fast", "double");

        let results = measure("10k dispatches", || {
            let handles: Vec<_> = (0..10_000u64)
                .map(|i| {
                    warden
                        .dispatcher()
                        .dispatch(&target, move || Promise::completed(i * 2))
                        .unwrap()
                })
                .collect();
            handles.into_iter().map(|h| h.wait()).collect::<Vec<_>>()
        });

        let successful = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(successful, 10_000);
        let metrics = warden.pools().get("fast").unwrap().metrics();
        println!("  Успешно: {}/{}", successful, results.len());
        println!("  Воркеров максимум: {}", metrics.largest_workers);
        assert!(metrics.largest_workers <= num_cpus::get() * 2);
    }

    #[test]
    fn load_test_2_bounded_pool_with_caller_runs() {
        println!("\n=== LOAD TEST 2: Ограниченная очередь и CallerRuns ===");
        let pool = warden::WorkerPool::with_spec(
            PoolSpec::builder("bounded")
                .with_core(2)
                .with_max(4)
                .with_keep_alive(Duration::from_millis(100))
                .with_work_queue(QueueKind::Bounded(8))
                .with_rejection(RejectionPolicy::CallerRuns)
                .build()
                .unwrap(),
        );

        let promises = measure("2k blocking tasks @ 1ms", || {
            (0..2_000)
                .map(|i| {
                    pool.submit(move || {
                        thread::sleep(Duration::from_millis(1));
                        i
                    })
                    .unwrap()
                })
                .collect::<Vec<_>>()
        });
        let sum: u64 = promises.into_iter().map(|p| p.wait().unwrap() as u64).sum();
        assert_eq!(sum, (0..2_000u64).sum());

        let metrics = pool.metrics();
        println!("  Выполнено: {}", metrics.completed_tasks);
        println!("  Отказов: {}", metrics.rejected_tasks);
        println!("  Success rate: {:.1}%", metrics.success_rate() * 100.0);
        assert_eq!(metrics.rejected_tasks, 0);
        assert!(metrics.largest_workers <= 4);
    }

    #[test]
    fn load_test_3_contended_locks() {
        println!("\n=== LOAD TEST 3: Конкуренция за блокировку ===");
        let catalog = Catalog::new()
            .with_method("load::Counter", "get", Declarations::new().with_lock(LockDecl::read()))
            .with_method("load::Counter", "inc", Declarations::new().with_lock(LockDecl::write()));
        let warden = Arc::new(Warden::builder().catalog(catalog).build());
        let counter = Arc::new(AtomicUsize::new(0));

        measure("16 threads x 500 ops", || {
            let threads: Vec<_> = (0..16)
                .map(|i| {
                    let warden = warden.clone();
                    let counter = counter.clone();
                    thread::spawn(move || {
                        let get = TargetId::new("load::Counter", "get");
                        let inc = TargetId::new("load::Counter", "inc");
                        for n in 0..500 {
                            if (i + n) % 5 == 0 {
                                warden
                                    .locks()
                                    .run(&inc, || {
                                        // Инкремент не атомарный, его защищает блокировка записи
                                        let value = counter.load(Ordering::Relaxed);
                                        counter.store(value + 1, Ordering::Relaxed);
                                    })
                                    .unwrap();
                            } else {
                                warden
                                    .locks()
                                    .run(&get, || counter.load(Ordering::Relaxed))
                                    .unwrap();
                            }
                        }
                    })
                })
                .collect();
            for t in threads {
                t.join().unwrap();
            }
        });

        let expected = (0..16)
            .map(|i| (0..500).filter(|n| (i + n) % 5 == 0).count())
            .sum::<usize>();
        println!("  Записей: {}", counter.load(Ordering::SeqCst));
        assert_eq!(counter.load(Ordering::SeqCst), expected);
    }

    #[test]
    fn load_test_4_throttled_with_timeouts() {
        println!("\n=== LOAD TEST 4: Троттлинг с таймаутами ===");
        let catalog = Catalog::new()
            .with_type("load::Api", Declarations::new().with_group(GroupDecl::permits(4).fair(true)))
            .with_method(
                "load::Api",
                "call",
                Declarations::new().with_throttle(
                    ThrottleDecl::default()
                        .weight(2)
                        .timeout(Duration::from_millis(5)),
                ),
            );
        let warden = Arc::new(Warden::builder().catalog(catalog).build());
        let in_use = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let (passed, timed_out) = measure("32 threads x 50 calls", || {
            let threads: Vec<_> = (0..32)
                .map(|_| {
                    let warden = warden.clone();
                    let in_use = in_use.clone();
                    let peak = peak.clone();
                    thread::spawn(move || {
                        let target = TargetId::new("load::Api", "call");
                        let (mut passed, mut timed_out) = (0, 0);
                        for _ in 0..50 {
                            let outcome = warden.throttles().run(&target, || {
                                let now = in_use.fetch_add(2, Ordering::SeqCst) + 2;
                                peak.fetch_max(now, Ordering::SeqCst);
                                thread::sleep(Duration::from_micros(200));
                                in_use.fetch_sub(2, Ordering::SeqCst);
                            });
                            match outcome {
                                Ok(()) => passed += 1,
                                Err(ControlError::AcquireTimeout { .. }) => timed_out += 1,
                                Err(err) => panic!("unexpected error: {err}"),
                            }
                        }
                        (passed, timed_out)
                    })
                })
                .collect();
            threads
                .into_iter()
                .map(|t| t.join().unwrap())
                .fold((0, 0), |acc, r| (acc.0 + r.0, acc.1 + r.1))
        });

        println!("  Прошло: {}, таймаутов: {}", passed, timed_out);
        println!("  Пик занятых разрешений: {}", peak.load(Ordering::SeqCst));
        assert_eq!(passed + timed_out, 32 * 50);
        assert!(passed > 0);
        assert!(peak.load(Ordering::SeqCst) <= 4);

        let policy = warden.throttles().policy(&TargetId::new("load::Api", "call")).unwrap();
        let metrics = policy.metrics();
        assert_eq!(metrics.available, 4, "Все разрешения возвращены");
        assert_eq!(metrics.waiting, 0);
    }

    #[test]
    fn load_test_5_dispatch_with_panics() {
        println!("\n=== LOAD TEST 5: Dispatch с паниками ===");
        let warden = Warden::builder().build();
        let target = TargetId::deferred("load::Flaky", "run");

        let results = measure("1k dispatches, каждая 10-я паникует", || {
            let handles: Vec<_> = (0..1_000)
                .map(|i| {
                    warden
                        .dispatcher()
                        .dispatch(&target, move || {
                            if i % 10 == 0 {
                                panic!("Intentional panic at {}", i);
                            }
                            Promise::completed(i)
                        })
                        .unwrap()
                })
                .collect();
            handles.into_iter().map(|h| h.wait()).collect::<Vec<_>>()
        });

        let successful = results.iter().filter(|r| r.is_ok()).count();
        let panicked = results
            .iter()
            .filter(|r| matches!(r, Err(ControlError::Panicked(_))))
            .count();
        println!("  Успешно: {}", successful);
        println!("  Паник перехвачено: {}", panicked);
        assert_eq!(successful, 900);
        assert_eq!(panicked, 100);

        let metrics = warden.pools().get(warden::DEFAULT_POOL).unwrap().metrics();
        println!("  Pool success rate: {:.1}%", metrics.success_rate() * 100.0);
        assert_eq!(metrics.failed_tasks, 0, "Паника тела не роняет задачу пула");
    }

    #[test]
    fn load_test_6_cancel_storm() {
        println!("\n=== LOAD TEST 6: Массовая отмена ===");
        let warden = Warden::builder()
            .pool(PoolSpec::builder(warden::DEFAULT_POOL).with_core(4).with_max(4).build().unwrap())
            .build();
        let target = TargetId::deferred("load::Slow", "wait");
        let cancelled_inner = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..200)
            .map(|_| {
                let cancelled_inner = cancelled_inner.clone();
                warden
                    .dispatcher()
                    .dispatch(&target, move || {
                        let promise = Promise::<()>::new();
                        let token = promise.cancellation_token();
                        let cancelled_inner = cancelled_inner.clone();
                        thread::spawn(move || {
                            if token.is_cancelled() {
                                cancelled_inner.fetch_add(1, Ordering::SeqCst);
                                return;
                            }
                            let deadline = Instant::now() + Duration::from_secs(5);
                            while !token.is_cancelled() && Instant::now() < deadline {
                                thread::sleep(Duration::from_millis(1));
                            }
                            if token.is_cancelled() {
                                cancelled_inner.fetch_add(1, Ordering::SeqCst);
                            }
                        });
                        promise
                    })
                    .unwrap()
            })
            .collect();

        let cancelled = measure("cancel 200 handles", || {
            handles.iter().filter(|h| h.cancel()).count()
        });
        assert_eq!(cancelled, 200);
        for handle in handles {
            assert!(matches!(handle.wait(), Err(ControlError::Cancelled)));
        }

        let pool = warden.pools().get(warden::DEFAULT_POOL).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while pool.metrics().active_tasks > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        println!("  Внутренних отмен: {}", cancelled_inner.load(Ordering::SeqCst));
        assert_eq!(pool.metrics().active_tasks, 0, "Воркеры освобождаются после отмены");
        assert!(warden.shutdown().is_empty());
    }
}
