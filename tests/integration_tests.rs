mod common;

use common::EchoEngine;
use llama_bridge::{Bridge, BridgeError, ContextParams, LoadedModel, StopReason};
use std::sync::Arc;

fn bridge() -> (Arc<EchoEngine>, Bridge) {
    let engine = Arc::new(EchoEngine::new());
    let bridge = Bridge::new(engine.clone());
    (engine, bridge)
}

mod test_lifecycle {
    use super::*;

    #[test]
    fn test_load_generate_free() {
        let (engine, bridge) = bridge();

        let handle = bridge.initialize_model("/models/tiny.gguf").unwrap();
        assert_ne!(handle.into_raw(), 0);
        assert_eq!(bridge.live_models(), 1);

        assert_eq!(bridge.generate(handle, "hello there").unwrap(), "echo: hello there");
        assert_eq!(bridge.generate(handle, "again").unwrap(), "echo: again");

        bridge.free_model(handle).unwrap();
        assert_eq!(bridge.live_models(), 0);
        assert_eq!(engine.loads(), 1);
        assert_eq!(engine.drops(), 1);
    }

    #[test]
    fn test_load_failure_is_reported() {
        let (engine, bridge) = bridge();

        let err = bridge.initialize_model("/models/missing.gguf").unwrap_err();
        match err {
            BridgeError::ModelLoad { path, message } => {
                assert_eq!(path.to_str(), Some("/models/missing.gguf"));
                assert!(message.contains("no such model"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(bridge.live_models(), 0);
        assert_eq!(engine.loads(), 0);
    }

    #[test]
    fn test_use_after_free_is_rejected() {
        let (engine, bridge) = bridge();
        let handle = bridge.initialize_model("/models/tiny.gguf").unwrap();
        bridge.free_model(handle).unwrap();

        assert!(matches!(bridge.generate(handle, "hi"), Err(BridgeError::Released(_))));
        assert!(matches!(bridge.free_model(handle), Err(BridgeError::Released(_))));
        assert!(matches!(bridge.meta(handle), Err(BridgeError::Released(_))));
        // The double free never reached the engine.
        assert_eq!(engine.drops(), 1);
    }

    #[test]
    fn test_reloaded_slot_keeps_old_handle_dead() {
        let (_engine, bridge) = bridge();
        let first = bridge.initialize_model("/models/a.gguf").unwrap();
        bridge.free_model(first).unwrap();
        let second = bridge.initialize_model("/models/b.gguf").unwrap();

        assert_ne!(first, second);
        assert!(!bridge.is_live(first));
        assert!(bridge.generate(first, "hi").unwrap_err().is_handle_error());
        assert_eq!(bridge.meta(second).unwrap().name, "b");
    }

    #[test]
    fn test_handles_are_independent() {
        let (engine, bridge) = bridge();
        let a = bridge.initialize_model("/models/a.gguf").unwrap();
        let b = bridge.initialize_model("/models/b.gguf").unwrap();

        bridge.free_model(a).unwrap();
        assert_eq!(bridge.generate(b, "still here").unwrap(), "echo: still here");
        assert_eq!(engine.drops(), 1);

        drop(bridge);
        assert_eq!(engine.drops(), 2);
    }

    #[test]
    fn test_generation_error_is_wrapped() {
        let (_engine, bridge) = bridge();
        let handle = bridge.initialize_model("/models/tiny.gguf").unwrap();

        let err = bridge.generate(handle, "").unwrap_err();
        assert!(matches!(err, BridgeError::Generation(ref m) if m.contains("no tokens")));
        assert!(bridge.is_live(handle));
    }
}

mod test_params {
    use super::*;

    #[test]
    fn test_params_reach_the_engine() {
        let (_engine, bridge) = bridge();
        let params = ContextParams {
            num_predict: 2,
            ..ContextParams::default()
        };
        let handle = bridge.initialize_model_with("/models/tiny.gguf", &params).unwrap();

        let generation = bridge.generate_stream(handle, "one two three", |_| true).unwrap();
        assert_eq!(generation.text, "echo: one ");
        assert_eq!(generation.stop_reason, StopReason::Length);
        assert_eq!(generation.generated_tokens, 2);
    }

    #[test]
    fn test_reload_swaps_handles() {
        let (engine, bridge) = bridge();
        let old = bridge.initialize_model("/models/tiny.gguf").unwrap();
        let params = ContextParams {
            num_predict: 1,
            ..ContextParams::default()
        };

        let new = bridge.reload_with(old, &params).unwrap();
        assert_ne!(old, new);
        assert!(matches!(bridge.generate(old, "hi"), Err(BridgeError::Released(_))));
        assert_eq!(bridge.generate(new, "hi there").unwrap(), "echo: ");
        assert_eq!(bridge.meta(new).unwrap().name, "tiny");
        assert_eq!(bridge.live_models(), 1);
        assert_eq!(engine.drops(), 1);
    }

    #[test]
    fn test_failed_reload_keeps_old_handle() {
        let (engine, bridge) = bridge();
        let handle = bridge.initialize_model("/models/tiny.gguf").unwrap();
        let params = ContextParams {
            num_ctx: 0,
            ..ContextParams::default()
        };

        let err = bridge.reload_with(handle, &params).unwrap_err();
        assert!(matches!(err, BridgeError::ModelLoad { .. }));
        assert!(bridge.is_live(handle));
        assert_eq!(bridge.generate(handle, "still").unwrap(), "echo: still");
        assert_eq!(engine.drops(), 0);
    }

    #[test]
    fn test_stop_sequences() {
        let (_engine, bridge) = bridge();
        let params = ContextParams::default().with_json(r#"{"stop": ["three"]}"#).unwrap();
        let handle = bridge.initialize_model_with("/models/tiny.gguf", &params).unwrap();

        let mut streamed = String::new();
        let generation = bridge
            .generate_stream(handle, "one two three four", |piece| {
                streamed.push_str(piece);
                true
            })
            .unwrap();

        assert_eq!(generation.stop_reason, StopReason::StopSequence);
        assert_eq!(generation.text, "echo: one two ");
        assert_eq!(streamed, generation.text);
    }
}

mod test_streaming {
    use super::*;

    #[test]
    fn test_pieces_concatenate_to_text() {
        let (_engine, bridge) = bridge();
        let handle = bridge.initialize_model("/models/tiny.gguf").unwrap();

        let mut pieces = Vec::new();
        let generation = bridge
            .generate_stream(handle, "a b c", |piece| {
                pieces.push(piece.to_string());
                true
            })
            .unwrap();

        assert_eq!(pieces, vec!["echo: ", "a ", "b ", "c"]);
        assert_eq!(pieces.concat(), generation.text);
        assert_eq!(generation.stop_reason, StopReason::Eos);
    }

    #[test]
    fn test_callback_can_cancel() {
        let (_engine, bridge) = bridge();
        let handle = bridge.initialize_model("/models/tiny.gguf").unwrap();

        let mut calls = 0;
        let generation = bridge
            .generate_stream(handle, "a b c", |_| {
                calls += 1;
                calls < 2
            })
            .unwrap();

        assert_eq!(calls, 2);
        assert_eq!(generation.stop_reason, StopReason::Cancelled);
    }

    #[test]
    fn test_free_during_generation_defers_teardown() {
        let (engine, bridge) = bridge();
        let handle = bridge.initialize_model("/models/tiny.gguf").unwrap();

        let mut freed = false;
        let text = bridge
            .generate_stream(handle, "keep going", |_| {
                if !freed {
                    bridge.free_model(handle).unwrap();
                    freed = true;
                    assert_eq!(engine.drops(), 0);
                }
                true
            })
            .unwrap()
            .text;

        assert_eq!(text, "echo: keep going");
        assert_eq!(engine.drops(), 1);
        assert!(matches!(bridge.generate(handle, "x"), Err(BridgeError::Released(_))));
    }

    #[test]
    fn test_reentrant_call_is_rejected() {
        let (_engine, bridge) = bridge();
        let handle = bridge.initialize_model("/models/tiny.gguf").unwrap();

        let mut inner = Vec::new();
        let generation = bridge
            .generate_stream(handle, "outer call", |_| {
                if inner.is_empty() {
                    inner.push(bridge.generate(handle, "inner"));
                    inner.push(bridge.meta(handle).map(|m| m.name));
                }
                true
            })
            .unwrap();

        assert_eq!(generation.text, "echo: outer call");
        assert_eq!(inner.len(), 2);
        for result in inner {
            assert!(matches!(result, Err(BridgeError::Busy(raw)) if raw == handle.into_raw()));
        }
        assert_eq!(bridge.generate(handle, "after").unwrap(), "echo: after");
    }

    #[test]
    fn test_other_handles_usable_from_callback() {
        let (_engine, bridge) = bridge();
        let outer = bridge.initialize_model("/models/a.gguf").unwrap();
        let other = bridge.initialize_model("/models/b.gguf").unwrap();

        let mut nested = None;
        bridge
            .generate_stream(outer, "go", |_| {
                if nested.is_none() {
                    nested = Some(bridge.generate(other, "nested").unwrap());
                }
                true
            })
            .unwrap();
        assert_eq!(nested.as_deref(), Some("echo: nested"));
    }

    #[test]
    fn test_concurrent_generate_on_one_handle() {
        let (_engine, bridge) = bridge();
        let handle = bridge.initialize_model("/models/tiny.gguf").unwrap();

        std::thread::scope(|s| {
            let workers: Vec<_> = (0..8)
                .map(|i| {
                    let bridge = &bridge;
                    s.spawn(move || bridge.generate(handle, &format!("worker {i}")).unwrap())
                })
                .collect();
            for (i, worker) in workers.into_iter().enumerate() {
                assert_eq!(worker.join().unwrap(), format!("echo: worker {i}"));
            }
        });

        bridge.free_model(handle).unwrap();
    }
}

mod test_loaded_model {
    use super::*;

    #[test]
    fn test_scoped_release() {
        let engine = EchoEngine::new();
        {
            let mut model = LoadedModel::load(&engine, "/models/owned.gguf", &ContextParams::default()).unwrap();
            assert_eq!(model.generate("hi").unwrap(), "echo: hi");
            assert_eq!(model.meta().name, "owned");
            assert_eq!(model.path().to_str(), Some("/models/owned.gguf"));
            assert_eq!(engine.drops(), 0);
        }
        assert_eq!(engine.drops(), 1);
    }

    #[test]
    fn test_load_failure() {
        let engine = EchoEngine::new();
        let result = LoadedModel::load(&engine, "/models/missing.gguf", &ContextParams::default());
        assert!(matches!(result, Err(BridgeError::ModelLoad { .. })));
    }
}
