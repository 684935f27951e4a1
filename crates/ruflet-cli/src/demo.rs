//! Built-in counter app served by `ruflet serve`.

use ruflet_core::page::Slots;
use ruflet_core::{Control, Event, Page, Value};

fn current_count(page: &Page) -> i64 {
    page.control("count")
        .and_then(|c| c.value("value"))
        .and_then(|v| v.to_key_string().parse().ok())
        .unwrap_or(0)
}

fn bump(page: &mut Page, delta: i64) -> anyhow::Result<()> {
    let next = current_count(page) + delta;
    page.update("count", [("value", Value::from(next.to_string()))]);
    Ok(())
}

pub fn counter(page: &mut Page) -> anyhow::Result<()> {
    page.set_view_props([
        ("vertical_alignment", "center"),
        ("horizontal_alignment", "center"),
    ]);

    let count = Control::new("text").with_id("count").with_prop("value", "0").with_prop("size", 40);
    let minus = Control::new("icon_button")
        .with_prop("icon", 0xe516)
        .on("click", |page: &mut Page, _: &Event| bump(page, -1));
    let plus = Control::new("icon_button")
        .with_prop("icon", 0xe047)
        .on("click", |page: &mut Page, _: &Event| bump(page, 1));
    let row = Control::new("row")
        .with_prop("alignment", "center")
        .with_children([minus, count, plus]);

    let reset = Control::new("floating_action_button")
        .with_prop("icon", 0xe514)
        .on("click", |page: &mut Page, _: &Event| {
            page.update("count", [("value", "0")]);
            Ok(())
        });

    page.add_with(
        vec![row],
        Slots {
            appbar: Some(Control::new("appbar").with_prop("title", Control::new("text").with_prop("value", "Counter"))),
            floating_action_button: Some(reset),
            ..Default::default()
        },
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_counter_increments_and_resets() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut page = Page::new("demo", Value::map(), tx);
        counter(&mut page).unwrap();

        let row = page.registry().resolve(&100i64.into()).unwrap();
        let plus = row.children()[2].clone();
        let target = Value::Int(plus.wire_id().unwrap());
        page.dispatch_event(&target, "click", Value::Nil).unwrap();
        page.dispatch_event(&target, "click", Value::Nil).unwrap();
        assert_eq!(current_count(&page), 2);

        let minus = row.children()[0].clone();
        let target = Value::Int(minus.wire_id().unwrap());
        for _ in 0..3 {
            page.dispatch_event(&target, "click", Value::Nil).unwrap();
        }
        assert_eq!(current_count(&page), -1);
    }
}
