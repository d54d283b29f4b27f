
#[allow(dead_code, unused)]
mod grader_rt {
    use std::collections::BTreeMap;
    use std::io::Write;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Mutex, MutexGuard};

    const COUNT_CALLS: bool = @@COUNT_CALLS@@;
    const COUNT_DEPTH: bool = @@COUNT_DEPTH@@;
    const COUNT_LOOPS: bool = @@COUNT_LOOPS@@;
    const COUNT_CLASSES: bool = @@COUNT_CLASSES@@;

    struct State {
        calls: BTreeMap<&'static str, u64>,
        active: BTreeMap<&'static str, u64>,
        deepest: BTreeMap<&'static str, u64>,
        loops: BTreeMap<&'static str, u64>,
        classes: BTreeMap<&'static str, u64>,
        errors: Vec<String>,
    }

    static STATE: Mutex<State> = Mutex::new(State {
        calls: BTreeMap::new(),
        active: BTreeMap::new(),
        deepest: BTreeMap::new(),
        loops: BTreeMap::new(),
        classes: BTreeMap::new(),
        errors: Vec::new(),
    });
    static EMITTED: AtomicBool = AtomicBool::new(false);

    fn state() -> MutexGuard<'static, State> {
        STATE.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub struct Frame {
        name: &'static str,
    }

    pub fn enter(name: &'static str) -> Frame {
        let mut s = state();
        *s.calls.entry(name).or_insert(0) += 1;
        let active = s.active.entry(name).or_insert(0);
        *active += 1;
        let depth = *active;
        let deepest = s.deepest.entry(name).or_insert(0);
        if depth > *deepest {
            *deepest = depth;
        }
        Frame { name }
    }

    impl Drop for Frame {
        fn drop(&mut self) {
            if let Some(active) = state().active.get_mut(self.name) {
                *active = active.saturating_sub(1);
            }
        }
    }

    pub fn construct(name: &'static str) {
        if COUNT_CLASSES {
            *state().classes.entry(name).or_insert(0) += 1;
        }
    }

    pub fn loop_hit(kind: &'static str) {
        if COUNT_LOOPS {
            *state().loops.entry(kind).or_insert(0) += 1;
        }
    }

    fn json_string(text: &str) -> String {
        let mut out = String::from("\"");
        for c in text.chars() {
            match c {
                '"' => out.push_str("\\\""),
                '\\' => out.push_str("\\\\"),
                c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
                c => out.push(c),
            }
        }
        out.push('"');
        out
    }

    fn json_map(map: &BTreeMap<&'static str, u64>, on: bool) -> String {
        let items: Vec<String> = if on {
            map.iter()
                .map(|(key, value)| format!("{}:{}", json_string(key), value))
                .collect()
        } else {
            Vec::new()
        };
        format!("{{{}}}", items.join(","))
    }

    pub fn emit() {
        if EMITTED.swap(true, Ordering::SeqCst) {
            return;
        }
        let body = {
            let s = state();
            let errors: Vec<String> = s.errors.iter().map(|e| json_string(e)).collect();
            format!(
                "{{\"function_calls\":{},\"recursion_depth\":{},\"loop_iterations\":{},\"class_instantiations\":{},\"dom_operations\":[],\"event_handlers\":[],\"errors\":[{}]}}",
                json_map(&s.calls, COUNT_CALLS),
                json_map(&s.deepest, COUNT_DEPTH),
                json_map(&s.loops, true),
                json_map(&s.classes, true),
                errors.join(","),
            )
        };
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        let _ = out.flush();
        let _ = write!(out, "\n@@TRACE_BEGIN@@\n{}\n@@TRACE_END@@\n", body);
        let _ = out.flush();
    }

    extern "C" {
        fn atexit(callback: extern "C" fn()) -> i32;
    }

    extern "C" fn at_exit() {
        emit();
    }

    pub fn install() {
        unsafe {
            atexit(at_exit);
        }
        let default = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let payload = info.payload();
            let message = if let Some(text) = payload.downcast_ref::<&str>() {
                text.to_string()
            } else if let Some(text) = payload.downcast_ref::<String>() {
                text.clone()
            } else {
                String::from("Box<dyn Any>")
            };
            if let Ok(mut s) = STATE.try_lock() {
                s.errors.push(format!("panicked: {}", message));
            }
            default(info);
        }));
    }
}
