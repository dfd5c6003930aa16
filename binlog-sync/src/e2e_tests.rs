#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use binlog_sync_test_utils::{init_tracing, unique_name, Journal};

    use crate::canal::{Canal, CanalBuilder, CanalState};
    use crate::cdc_types::{Action, BinlogEvent, RowsEvent, TableSchema, Value};
    use crate::checkpoints::{PersistedPosition, Position, PositionSaver};
    use crate::config::StartPosition;
    use crate::error::SyncError;
    use crate::registry::ALL_TABLES;
    use crate::test_utilities::{
        Failure, MemoryPositionSaver, RecordingHandler, ScriptStep, ScriptedSource,
    };

    const START_NAME: &str = "mysql-bin.000005";
    const START_OFFSET: u32 = 4820;

    fn rows(table: &str, action: Action, log_pos: u32) -> BinlogEvent {
        let rows = match action {
            Action::Update => vec![
                vec![Value::Int(1), Value::Text("pending".to_string())],
                vec![Value::Int(1), Value::Text("paid".to_string())],
            ],
            _ => vec![vec![Value::Int(1), Value::Text("pending".to_string())]],
        };
        let table = Arc::new(TableSchema::new("shop", table).with_columns(["id", "status"]));
        BinlogEvent::Rows {
            event: RowsEvent::new(action, table, rows).unwrap(),
            log_pos,
        }
    }

    fn rotate(next_name: &str, offset: u32) -> BinlogEvent {
        BinlogEvent::Rotate {
            next_name: next_name.to_string(),
            offset,
        }
    }

    struct Setup {
        source: Arc<ScriptedSource>,
        saver: Arc<MemoryPositionSaver>,
        journal: Journal,
        canal: Canal,
    }

    async fn setup(steps: Vec<ScriptStep>, handlers: Vec<(&str, &RecordingHandler)>) -> Setup {
        init_tracing();
        let journal = Journal::new();
        let source = Arc::new(ScriptedSource::with_steps(START_NAME, START_OFFSET, steps));
        let saver = Arc::new(MemoryPositionSaver::new().with_journal(journal.clone()));

        let mut builder = CanalBuilder::new()
            .source(source.clone())
            .position_saver(saver.clone())
            .database("shop");
        for (table, handler) in handlers {
            let handler = handler.clone().with_journal(journal.clone());
            builder = builder.handler(table, handler.into_dyn());
        }

        Setup {
            source,
            saver,
            journal,
            canal: builder.build().await.unwrap(),
        }
    }

    fn events(events: Vec<BinlogEvent>) -> Vec<ScriptStep> {
        events.into_iter().map(ScriptStep::Event).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_wildcard_handler_tracks_position() {
        let wildcard = RecordingHandler::new("wildcard");
        let s = setup(
            events(vec![
                rows("orders", Action::Insert, 4900),
                rows("orders", Action::Update, 5000),
                rows("orders", Action::Delete, 5100),
            ]),
            vec![(ALL_TABLES, &wildcard)],
        )
        .await;

        s.canal.run().await.unwrap();

        assert_eq!(
            wildcard.events(),
            vec![
                (Action::Insert, "orders".to_string(), 1),
                (Action::Update, "orders".to_string(), 2),
                (Action::Delete, "orders".to_string(), 1),
            ]
        );
        let position = s.canal.position().await.unwrap();
        assert_eq!(position.name, START_NAME);
        assert_eq!(position.offset, 5100);
        assert!(position.last_persisted_at.is_some());
        assert_eq!(s.source.subscribed_from(), vec![Position::new(START_NAME, START_OFFSET)]);

        // The clock never moved: one debounced save, then the forced one on shutdown.
        assert_eq!(
            s.saver.saved(),
            vec![
                PersistedPosition {
                    name: START_NAME.to_string(),
                    position: 4900
                },
                PersistedPosition {
                    name: START_NAME.to_string(),
                    position: 5100
                },
            ]
        );
        assert_eq!(s.canal.state(), CanalState::Stopped);
    }

    #[tokio::test]
    async fn test_events_are_fully_dispatched_in_order() {
        let slow = RecordingHandler::new("slow").with_delay(Duration::from_millis(30));
        let fast = RecordingHandler::new("fast");
        let s = setup(
            events(vec![
                rows("orders", Action::Insert, 4900),
                rows("orders", Action::Update, 5000),
                rows("orders", Action::Delete, 5100),
            ]),
            vec![("orders", &slow), (ALL_TABLES, &fast)],
        )
        .await;

        s.canal.run().await.unwrap();

        let entries = s.journal.entries();
        let span = |action: &str| {
            let indices: Vec<usize> = entries
                .iter()
                .enumerate()
                .filter(|(_, e)| {
                    (e.starts_with("begin:") || e.starts_with("end:"))
                        && e.contains(&format!(":{action}:"))
                })
                .map(|(i, _)| i)
                .collect();
            (indices[0], *indices.last().unwrap())
        };

        let insert = span("insert");
        let update = span("update");
        let delete = span("delete");
        assert!(insert.1 < update.0);
        assert!(update.1 < delete.0);
        assert_eq!(slow.handled(), 3);
        assert_eq!(fast.handled(), 3);
    }

    #[tokio::test]
    async fn test_broken_handler_does_not_stop_delivery() {
        let first = RecordingHandler::new("first");
        let broken = RecordingHandler::new("broken").fail_handle(Failure::Other);
        let third = RecordingHandler::new("third");
        let s = setup(
            events(vec![
                rows("orders", Action::Insert, 4900),
                rows("orders", Action::Delete, 5000),
            ]),
            vec![("orders", &first), ("orders", &broken), ("orders", &third)],
        )
        .await;

        s.canal.run().await.unwrap();

        assert_eq!(first.handled(), 2);
        assert_eq!(broken.handled(), 2);
        assert_eq!(third.handled(), 2);
        assert_eq!(s.canal.position().await.unwrap().offset, 5000);
    }

    #[tokio::test]
    async fn test_interrupt_stops_the_canal() {
        let stopper = RecordingHandler::new("stopper").fail_handle_from(2, Failure::Interrupted);
        let healthy = RecordingHandler::new("healthy");
        let s = setup(
            events(vec![
                rows("orders", Action::Insert, 4900),
                rows("orders", Action::Update, 5000),
                rows("orders", Action::Delete, 5100),
            ]),
            vec![("orders", &stopper), ("orders", &healthy)],
        )
        .await;

        let mut states = s.canal.watch_state();
        healthy.watch_canal(s.canal.watch_state());
        let err = s.canal.run().await.unwrap_err();

        match err {
            SyncError::Interrupted { handler, .. } => assert_eq!(handler, "stopper"),
            other => panic!("unexpected error: {other:?}"),
        }
        // The interrupted event was delivered to both, the next one to nobody.
        assert_eq!(healthy.handled(), 2);
        assert_eq!(s.source.remaining(), 1);
        assert!(s.source.is_closed());

        // Stopping flushed every handler and kept the cursor before the
        // interrupted event.
        assert_eq!(stopper.completed(), 1);
        assert_eq!(healthy.completed(), 1);
        assert_eq!(s.canal.position().await.unwrap().offset, 4900);
        assert_eq!(s.saver.saved().last().unwrap().position, 4900);

        assert_eq!(healthy.states_at_complete(), vec![CanalState::Stopping]);
        assert!(states.has_changed().unwrap());
        assert_eq!(*states.borrow_and_update(), CanalState::Stopped);
    }

    #[tokio::test]
    async fn test_rotation_flushes_before_saving_new_file() {
        let handler = RecordingHandler::new("search");
        let s = setup(
            events(vec![
                rows("orders", Action::Insert, 4900),
                rotate("mysql-bin.000006", 4),
                rows("orders", Action::Insert, 120),
            ]),
            vec![("orders", &handler)],
        )
        .await;

        s.canal.run().await.unwrap();

        let complete = s.journal.position_of("complete:search").unwrap();
        let save = s.journal.position_of("save:mysql-bin.000006:4").unwrap();
        assert!(complete < save);
        assert!(s.journal.position_of("begin:search:insert:orders").unwrap() < complete);

        // Once for the rotation, once on shutdown.
        assert_eq!(handler.completed(), 2);
        let position = s.canal.position().await.unwrap();
        assert_eq!(
            (position.name.as_str(), position.offset),
            ("mysql-bin.000006", 120)
        );
        assert_eq!(
            s.saver.saved().last().unwrap(),
            &PersistedPosition {
                name: "mysql-bin.000006".to_string(),
                position: 120
            }
        );
    }

    #[tokio::test]
    async fn test_interrupted_rotation_keeps_old_file() {
        let handler = RecordingHandler::new("search").fail_complete(Failure::Interrupted);
        let s = setup(
            events(vec![
                rows("orders", Action::Insert, 4900),
                rotate("mysql-bin.000006", 4),
                rows("orders", Action::Insert, 120),
            ]),
            vec![("orders", &handler)],
        )
        .await;

        let err = s.canal.run().await.unwrap_err();

        assert!(err.is_interrupted());
        assert_eq!(handler.handled(), 1);
        let position = s.canal.position().await.unwrap();
        assert_eq!((position.name.as_str(), position.offset), (START_NAME, 4900));
    }

    #[tokio::test]
    async fn test_exact_and_wildcard_registrations() {
        let orders_only = RecordingHandler::new("orders-only");
        let everything = RecordingHandler::new("everything");
        let s = setup(
            events(vec![
                rows("orders", Action::Insert, 4900),
                rows("customers", Action::Insert, 5000),
            ]),
            vec![("orders", &orders_only), (ALL_TABLES, &everything)],
        )
        .await;

        s.canal.run().await.unwrap();

        let tables = |h: &RecordingHandler| -> Vec<String> {
            h.events().into_iter().map(|(_, table, _)| table).collect()
        };
        assert_eq!(tables(&orders_only), vec!["orders"]);
        assert_eq!(tables(&everything), vec!["orders", "customers"]);
    }

    #[tokio::test]
    async fn test_stop_finishes_gracefully() {
        let handler = RecordingHandler::new("search");
        let mut steps = events(vec![
            rows("orders", Action::Insert, 4900),
            rows("orders", Action::Insert, 5000),
        ]);
        steps.push(ScriptStep::Hang);
        let s = setup(steps, vec![(ALL_TABLES, &handler)]).await;

        let handle = s.canal.start();
        tokio::time::timeout(Duration::from_secs(5), async {
            while handler.handled() < 2 || s.canal.state() != CanalState::Running {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        // A second run is refused while the first one is going.
        assert!(matches!(s.canal.run().await, Err(SyncError::AlreadyRunning)));

        s.canal.stop();
        handle.await.unwrap();

        assert_eq!(s.canal.state(), CanalState::Stopped);
        assert!(s.source.is_closed());
        assert_eq!(handler.completed(), 1);
        assert_eq!(s.saver.saved().last().unwrap().position, 5000);
    }

    #[tokio::test]
    async fn test_stop_right_after_start_is_not_lost() {
        let s = setup(vec![ScriptStep::Hang], vec![]).await;

        let handle = s.canal.start();
        s.canal.stop();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(s.canal.state(), CanalState::Stopped);
    }

    #[tokio::test]
    async fn test_cancelled_run_can_be_started_again() {
        let handler = RecordingHandler::new("search");
        let mut steps = events(vec![rows("orders", Action::Insert, 4900)]);
        steps.push(ScriptStep::Hang);
        let s = setup(steps, vec![(ALL_TABLES, &handler)]).await;

        let res = tokio::time::timeout(Duration::from_millis(50), s.canal.run()).await;

        assert!(res.is_err());
        assert_eq!(s.canal.state(), CanalState::Stopped);
        assert_eq!(handler.handled(), 1);
        assert_eq!(handler.completed(), 0);

        // The next run continues after the last handled event and shuts down cleanly.
        s.canal.run().await.unwrap();
        assert_eq!(
            s.source.subscribed_from(),
            vec![
                Position::new(START_NAME, START_OFFSET),
                Position::new(START_NAME, 4900)
            ]
        );
        assert_eq!(handler.handled(), 1);
        assert_eq!(handler.completed(), 1);
        assert_eq!(s.saver.saved().last().unwrap().position, 4900);
    }

    #[tokio::test]
    async fn test_dropped_handle_returns_canal_to_stopped() {
        let s = setup(vec![ScriptStep::Hang], vec![]).await;
        let mut states = s.canal.watch_state();

        drop(s.canal.start());
        tokio::time::timeout(
            Duration::from_secs(5),
            states.wait_for(|state| *state == CanalState::Stopped),
        )
        .await
        .unwrap()
        .unwrap();

        let handle = s.canal.start();
        s.canal.stop();
        handle.await.unwrap();
        assert_eq!(s.canal.state(), CanalState::Stopped);
    }

    #[tokio::test]
    async fn test_failed_saves_do_not_stop_delivery() {
        let handler = RecordingHandler::new("search");
        let s = setup(
            events(vec![
                rows("orders", Action::Insert, 4900),
                rotate("mysql-bin.000006", 4),
                rows("orders", Action::Insert, 120),
            ]),
            vec![(ALL_TABLES, &handler)],
        )
        .await;
        s.saver.fail_saves(true);

        let err = s.canal.run().await.unwrap_err();

        // Only the final save is reported.
        match err {
            SyncError::PersistFailure { name, position, .. } => {
                assert_eq!((name.as_str(), position), ("mysql-bin.000006", 120))
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(handler.handled(), 2);
        assert_eq!(handler.completed(), 2);
        let position = s.canal.position().await.unwrap();
        assert_eq!(
            (position.name.as_str(), position.offset),
            ("mysql-bin.000006", 120)
        );
        assert!(position.last_persisted_at.is_none());
        assert!(s.saver.saved().is_empty());

        // Once the storage is back, a restart persists the latest position.
        s.saver.fail_saves(false);
        s.canal.run().await.unwrap();
        assert_eq!(
            s.saver.saved(),
            vec![PersistedPosition {
                name: "mysql-bin.000006".to_string(),
                position: 120
            }]
        );
    }

    #[tokio::test]
    async fn test_interrupt_wins_over_failed_final_save() {
        let stopper = RecordingHandler::new("stopper").fail_handle(Failure::Interrupted);
        let s = setup(
            events(vec![rows("orders", Action::Insert, 4900)]),
            vec![("orders", &stopper)],
        )
        .await;
        s.saver.fail_saves(true);

        let err = s.canal.run().await.unwrap_err();

        assert!(err.is_interrupted());
        assert_eq!(stopper.completed(), 1);
        assert!(s.saver.saved().is_empty());
        assert_eq!(s.canal.state(), CanalState::Stopped);
    }

    #[tokio::test]
    async fn test_upstream_error_stops_after_flush() {
        let handler = RecordingHandler::new("search");
        let s = setup(
            vec![
                ScriptStep::Event(rows("orders", Action::Insert, 4900)),
                ScriptStep::Error("connection reset".to_string()),
                ScriptStep::Event(rows("orders", Action::Insert, 5000)),
            ],
            vec![(ALL_TABLES, &handler)],
        )
        .await;

        let err = s.canal.run().await.unwrap_err();

        assert!(matches!(err, SyncError::Upstream(_)));
        assert_eq!(handler.handled(), 1);
        assert_eq!(handler.completed(), 1);
        assert_eq!(s.saver.saved().last().unwrap().position, 4900);
    }

    #[tokio::test]
    async fn test_excluded_tables_are_skipped_but_consumed() {
        let handler = RecordingHandler::new("search");
        let source = Arc::new(ScriptedSource::new(
            START_NAME,
            START_OFFSET,
            vec![
                rows("audit_log", Action::Insert, 4900),
                rows("orders", Action::Insert, 5000),
                rows("audit_log", Action::Insert, 5100),
            ],
        ));
        let canal = CanalBuilder::new()
            .source(source)
            .position_saver(Arc::new(MemoryPositionSaver::new()))
            .exclude_table(r"^shop\.audit_log$")
            .handler(ALL_TABLES, handler.clone().into_dyn())
            .build()
            .await
            .unwrap();

        canal.run().await.unwrap();

        assert_eq!(
            handler.events(),
            vec![(Action::Insert, "orders".to_string(), 1)]
        );
        assert_eq!(canal.position().await.unwrap().offset, 5100);
    }

    #[tokio::test]
    async fn test_start_from_saved_position() {
        let saver = Arc::new(MemoryPositionSaver::new());
        saver
            .save_position(&PersistedPosition {
                name: "mysql-bin.000003".to_string(),
                position: 777,
            })
            .await
            .unwrap();
        let source = Arc::new(ScriptedSource::new(START_NAME, START_OFFSET, vec![]));

        let canal = CanalBuilder::new()
            .source(source.clone())
            .position_saver(saver)
            .start_position(StartPosition::Saved)
            .build()
            .await
            .unwrap();
        canal.run().await.unwrap();

        assert_eq!(
            source.subscribed_from(),
            vec![Position::new("mysql-bin.000003", 777)]
        );
    }

    #[tokio::test]
    async fn test_saved_start_falls_back_to_upstream() {
        let source = Arc::new(ScriptedSource::new(START_NAME, START_OFFSET, vec![]));
        let canal = CanalBuilder::new()
            .source(source.clone())
            .position_saver(Arc::new(MemoryPositionSaver::new()))
            .start_position(StartPosition::Saved)
            .build()
            .await
            .unwrap();

        canal.run().await.unwrap();

        assert_eq!(
            source.subscribed_from(),
            vec![Position::new(START_NAME, START_OFFSET)]
        );
    }

    #[tokio::test]
    async fn test_unreadable_status_fails_initialization() {
        let canal = CanalBuilder::new()
            .source(Arc::new(ScriptedSource::failing_status("access denied")))
            .position_saver(Arc::new(MemoryPositionSaver::new()))
            .build()
            .await
            .unwrap();

        let err = canal.run().await.unwrap_err();

        assert!(matches!(err, SyncError::DataUnavailable(_)));
        assert_eq!(canal.state(), CanalState::Stopped);
        assert_eq!(canal.position().await, None);
    }

    #[tokio::test]
    async fn test_position_file_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(format!("{}.json", unique_name()));

        let first = CanalBuilder::new()
            .source(Arc::new(ScriptedSource::new(
                START_NAME,
                START_OFFSET,
                vec![rows("orders", Action::Insert, 4900)],
            )))
            .position_file(&path)
            .build()
            .await
            .unwrap();
        first.run().await.unwrap();

        let source = Arc::new(ScriptedSource::new("mysql-bin.000009", 4, vec![]));
        let second = CanalBuilder::new()
            .source(source.clone())
            .position_file(&path)
            .start_position(StartPosition::Saved)
            .build()
            .await
            .unwrap();
        second.run().await.unwrap();

        assert_eq!(
            source.subscribed_from(),
            vec![Position::new(START_NAME, 4900)]
        );
    }

    #[tokio::test]
    async fn test_handlers_registered_while_running_see_later_events() {
        let late = RecordingHandler::new("late");
        let mut steps = events(vec![rows("orders", Action::Insert, 4900)]);
        steps.push(ScriptStep::Hang);
        let s = setup(steps, vec![]).await;

        let handle = s.canal.start();
        tokio::time::timeout(Duration::from_secs(5), async {
            while s.canal.position().await.map(|p| p.offset) != Some(4900) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        s.canal
            .register_rows_event_handler("orders", [late.clone().into_dyn()])
            .await;
        s.canal.stop();
        handle.await.unwrap();

        // Too late for the event, but still flushed on shutdown.
        assert_eq!(late.handled(), 0);
        assert_eq!(late.completed(), 1);
    }
}
