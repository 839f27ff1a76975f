//! Builtin capability catalog.
//!
//! Static data only. Ordering here is the registration order used to break
//! priority ties.

pub(crate) struct BuiltinCapability {
    pub name: &'static str,
    pub capability: &'static str,
    pub summary: &'static str,
    pub actions: &'static [&'static str],
    pub triggers: &'static [(&'static str, &'static [&'static str])],
    pub examples: &'static [&'static str],
    pub priority: i32,
}

pub(crate) static BUILTIN_CAPABILITIES: &[BuiltinCapability] = &[
    BuiltinCapability {
        name: "calendar_create",
        capability: "calendar",
        summary: "Create a calendar event",
        actions: &["create_event"],
        triggers: &[
            ("en", &["schedule", "meeting with", "appointment", "book a", "add to my calendar"]),
            ("es", &["agendar", "agenda una", "reunión con", "cita"]),
        ],
        examples: &[
            "schedule a meeting with Ana tomorrow at 10",
            "book a dentist appointment on Friday",
        ],
        priority: 80,
    },
    BuiltinCapability {
        name: "calendar_delete",
        capability: "calendar",
        summary: "Cancel or delete a calendar event",
        actions: &["delete_event"],
        triggers: &[
            ("en", &["cancel meeting", "cancel the meeting", "delete event", "remove event"]),
            ("es", &["cancela la reunión", "borra el evento"]),
        ],
        examples: &["cancel the meeting with Ana"],
        priority: 75,
    },
    BuiltinCapability {
        name: "calendar_list",
        capability: "calendar",
        summary: "Show upcoming calendar events",
        actions: &["list_events"],
        triggers: &[
            ("en", &["calendar", "agenda", "what's on", "events", "my day"]),
            ("es", &["calendario", "eventos", "qué tengo hoy"]),
        ],
        examples: &["what's on my calendar today?", "show my agenda for tomorrow"],
        priority: 70,
    },
    BuiltinCapability {
        name: "task_create",
        capability: "database",
        summary: "Create a task or reminder",
        actions: &["create_task"],
        triggers: &[
            ("en", &["remind me", "add task", "new task", "create task", "todo", "to-do"]),
            ("es", &["recuérdame", "nueva tarea", "agrega tarea"]),
        ],
        examples: &["remind me to buy milk", "add task: call the bank"],
        priority: 80,
    },
    BuiltinCapability {
        name: "task_complete",
        capability: "database",
        summary: "Mark a task as done",
        actions: &["complete_task"],
        triggers: &[
            ("en", &["mark as done", "as done", "done with", "finished", "completed"]),
            ("es", &["terminé", "completé"]),
        ],
        examples: &["mark the milk task as done"],
        priority: 75,
    },
    BuiltinCapability {
        name: "task_delete",
        capability: "database",
        summary: "Delete a task",
        actions: &["delete_task"],
        triggers: &[
            ("en", &["delete task", "remove task", "delete the task", "remove the task"]),
            ("es", &["borra la tarea", "elimina la tarea"]),
        ],
        examples: &["delete the task about the report"],
        priority: 75,
    },
    BuiltinCapability {
        name: "task_list",
        capability: "database",
        summary: "List open tasks",
        actions: &["list_tasks"],
        triggers: &[
            ("en", &["my tasks", "tasks", "todo list", "what do i have to do"]),
            ("es", &["mis tareas", "tareas pendientes"]),
        ],
        examples: &["show my tasks", "what do I have to do today?"],
        priority: 70,
    },
    BuiltinCapability {
        name: "mail_send",
        capability: "mail",
        summary: "Write and send an email",
        actions: &["send_email"],
        triggers: &[
            ("en", &["send an email", "send email", "email to", "write to"]),
            ("es", &["envía un correo", "escribe a"]),
        ],
        examples: &["send an email to Bob saying I'll be late"],
        priority: 60,
    },
    BuiltinCapability {
        name: "mail_search",
        capability: "mail",
        summary: "Search the inbox",
        actions: &["search_emails"],
        triggers: &[
            ("en", &["inbox", "unread", "emails from", "any email"]),
            ("es", &["bandeja", "correos de"]),
        ],
        examples: &["any email from the bank?"],
        priority: 55,
    },
    BuiltinCapability {
        name: "memory_save",
        capability: "memory",
        summary: "Remember a fact for later",
        actions: &["save_memory"],
        triggers: &[
            ("en", &["remember that", "note that", "don't forget that"]),
            ("es", &["recuerda que", "anota que"]),
        ],
        examples: &["remember that my passport number ends in 42"],
        priority: 65,
    },
    BuiltinCapability {
        name: "memory_search",
        capability: "memory",
        summary: "Recall something you told me before",
        actions: &["search_memory"],
        triggers: &[
            ("en", &["do you remember", "what did i say", "what did i tell you", "recall"]),
            ("es", &["te acuerdas", "qué te dije"]),
        ],
        examples: &["what did I tell you about my passport?"],
        priority: 60,
    },
    BuiltinCapability {
        name: "chat",
        capability: "chat",
        summary: "General conversation",
        actions: &["respond"],
        triggers: &[
            ("en", &["hello", "thanks", "thank you", "how are you"]),
            ("es", &["hola", "gracias"]),
        ],
        examples: &["hello!", "thanks a lot"],
        priority: 10,
    },
];
