//! Canned engine behaviour for `--scripted`, so the front end can be tried
//! without a model server.

use penelope_backend::engine::scripted::script;
use penelope_backend::engine::{ScriptStep, ScriptedEngine};

/// Queue one turn. A reflective turn hesitates twice before a confident
/// echo; a plain turn samples once, so it only gets the echo.
pub fn queue_turn(engine: &mut ScriptedEngine, message: &str, plain: bool) {
    if !plain {
        engine.push_script(script(&["Hmm"], -6.5));
        engine.push_script(script(&["Well"], -4.0));
    }
    engine.push_script(reply(message));
}

fn reply(message: &str) -> Vec<ScriptStep> {
    let mut steps = vec![ScriptStep::token("You", -0.3), ScriptStep::token(" said", -0.4)];
    for word in message.split_whitespace() {
        steps.push(ScriptStep::token(&format!(" {word}"), -0.6));
    }
    steps.push(ScriptStep::token(".", -0.1));
    steps
}
