use std::{cell::Cell, cell::RefCell, rc::Rc};

use reactive_core::{
    effect::{make_scheduled_effect, EffectOptions},
    queue_job, queue_post_flush_cb, scheduler::next_tick, target::ReactiveCell, Job,
};

#[test]
fn batches_several_triggers_into_one_scheduled_run() {
    let source = ReactiveCell::new(0);
    let runs = Rc::new(Cell::new(0));

    {
        let source = source.clone();
        let runs = runs.clone();
        make_scheduled_effect(
            move || {
                let _ = source.get();
                runs.set(runs.get() + 1);
            },
            EffectOptions::default(),
        );
    }
    assert_eq!(runs.get(), 1, "effects run once synchronously on creation");

    source.set(1);
    source.set(2);
    source.set(3);
    assert_eq!(runs.get(), 1, "a scheduled effect does not re-run before the next flush");

    tokio_test::block_on(next_tick(None));
    assert_eq!(runs.get(), 2, "three triggers before a flush collapse into a single run");
}

#[test]
fn parent_effect_that_queues_a_child_runs_before_it() {
    let order = Rc::new(RefCell::new(Vec::<&'static str>::new()));
    let trigger = ReactiveCell::new(0);

    let child_trigger = trigger.clone();
    let child_order = order.clone();
    make_scheduled_effect(
        move || {
            let _ = child_trigger.get();
            child_order.borrow_mut().push("child");
        },
        EffectOptions::default(),
    );

    let parent_trigger = trigger.clone();
    let parent_order = order.clone();
    make_scheduled_effect(
        move || {
            let _ = parent_trigger.get();
            parent_order.borrow_mut().push("parent");
        },
        EffectOptions::default(),
    );

    order.borrow_mut().clear();
    trigger.set(1);
    tokio_test::block_on(next_tick(None));

    assert_eq!(*order.borrow(), vec!["parent", "child"]);
}

#[test]
fn self_recursive_trigger_is_gated_by_default() {
    let trigger = ReactiveCell::new(0);
    let runs = Rc::new(Cell::new(0));

    let inner_trigger = trigger.clone();
    let inner_runs = runs.clone();
    make_scheduled_effect(
        move || {
            let value = inner_trigger.get();
            inner_runs.set(inner_runs.get() + 1);
            if value == 1 {
                // writing to a dependency of the effect currently running
                // would recurse, but allow_recurse defaults to false.
                inner_trigger.set(2);
            }
        },
        EffectOptions::default(),
    );

    runs.set(0);
    trigger.set(1);
    tokio_test::block_on(next_tick(None));

    assert_eq!(runs.get(), 1, "a non-recursive effect must not re-enter itself");
}

#[test]
fn watcher_with_allow_recurse_may_trigger_itself_once_more() {
    let trigger = ReactiveCell::new(0);
    let runs = Rc::new(Cell::new(0));

    let inner_trigger = trigger.clone();
    let inner_runs = runs.clone();
    make_scheduled_effect(
        move || {
            let value = inner_trigger.get();
            inner_runs.set(inner_runs.get() + 1);
            if value == 1 {
                inner_trigger.set(2);
            }
        },
        EffectOptions {
            allow_recurse: true,
            ..EffectOptions::default()
        },
    );

    runs.set(0);
    trigger.set(1);
    tokio_test::block_on(next_tick(None));

    assert_eq!(runs.get(), 2, "an allow_recurse effect may re-enter itself once more");
}

struct CountingJob {
    id: u64,
    hits: Rc<Cell<u32>>,
}

impl Job for CountingJob {
    fn id(&self) -> Option<u64> {
        Some(self.id)
    }
    fn run(&self) {
        self.hits.set(self.hits.get() + 1);
    }
}

#[test]
fn invalidating_a_job_before_the_flush_reaches_it_skips_it() {
    let hits = Rc::new(Cell::new(0));
    let job: Rc<dyn Job> = Rc::new(CountingJob {
        id: 42,
        hits: hits.clone(),
    });

    queue_job(job.clone());
    reactive_core::invalidate_job(&job);

    tokio_test::block_on(next_tick(None));
    assert_eq!(hits.get(), 0);
}

#[test]
fn a_post_flush_callback_queued_from_another_post_flush_callback_still_runs() {
    let order = Rc::new(RefCell::new(Vec::<&'static str>::new()));

    let inner_order = order.clone();
    queue_post_flush_cb(
        move || {
            inner_order.borrow_mut().push("outer");
            let nested_order = inner_order.clone();
            queue_post_flush_cb(
                move || {
                    nested_order.borrow_mut().push("nested");
                },
                None,
            );
        },
        None,
    );

    tokio_test::block_on(next_tick(None));
    assert_eq!(*order.borrow(), vec!["outer", "nested"]);
}
